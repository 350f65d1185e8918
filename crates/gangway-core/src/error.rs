//! Operation errors for the gateway protocol
//!
//! The `Display` text of [`OpError`] is exactly what clients receive in the
//! `error` field of a reply, so variants here are wire contract, not just
//! diagnostics. OS-level failures map onto the matching variant where one
//! exists and pass their original text through otherwise.

use thiserror::Error;

/// Errors produced while handling one file-manager operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("path missing")]
    PathMissing,

    #[error("path too long")]
    PathTooLong,

    #[error("new name missing")]
    NameMissing,

    #[error("new name too long")]
    NameTooLong,

    #[error("size missing")]
    SizeMissing,

    #[error("size too big")]
    SizeTooBig,

    #[error("data missing")]
    DataMissing,

    #[error("data too big")]
    DataTooBig,

    /// Also used to mask access-control refusals, so a denied path is
    /// indistinguishable from a missing one.
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("path is a directory")]
    IsDirectory,

    #[error("file already exists")]
    AlreadyExists,

    #[error("too many transfers in progress")]
    TooManyTransfers,

    #[error("upload in progress")]
    UploadInProgress,

    #[error("download in progress")]
    DownloadInProgress,

    #[error("transfer not found")]
    TransferNotFound,

    #[error("too much data received")]
    TooMuchData,

    #[error("unknown message type")]
    UnknownType,

    /// Underlying OS error with no canonical variant, forwarded verbatim
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for OpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => OpError::NotFound,
            std::io::ErrorKind::PermissionDenied => OpError::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => OpError::AlreadyExists,
            _ => OpError::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_text() {
        assert_eq!(OpError::PathMissing.to_string(), "path missing");
        assert_eq!(OpError::NotFound.to_string(), "no such file or directory");
        assert_eq!(OpError::TooMuchData.to_string(), "too much data received");
        assert_eq!(
            OpError::TooManyTransfers.to_string(),
            "too many transfers in progress"
        );
    }

    #[test]
    fn test_common_io_kinds_get_canonical_text() {
        let err: OpError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err, OpError::NotFound);

        let err: OpError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err, OpError::PermissionDenied);

        let err: OpError = std::io::Error::from(std::io::ErrorKind::AlreadyExists).into();
        assert_eq!(err, OpError::AlreadyExists);
    }

    #[test]
    fn test_other_io_errors_pass_through_verbatim() {
        let io = std::io::Error::other("device wandered off");
        let err: OpError = io.into();
        assert_eq!(err.to_string(), "device wandered off");
    }
}
