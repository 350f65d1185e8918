//! Session protocol messages
//!
//! One WebSocket binary frame carries one MessagePack-encoded [`Message`]
//! (client to daemon) or [`Reply`] (daemon to client). Frames are encoded
//! with field names preserved so browser clients can decode them as plain
//! objects; empty optional fields are omitted entirely.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Request envelope sent by clients
///
/// `kind` discriminates the operation (`listDir`, `rename`, `delete`,
/// `createFolder`, `upload`, `uploadBlock`, `cancelUpload`, `download`).
/// Which of the remaining fields are meaningful depends on the operation;
/// unused fields stay at their zero value and are omitted on the wire.
///
/// A plain struct with a string discriminator is deliberate: an unknown
/// `kind` must still decode so the daemon can echo it back inside an
/// "unknown message type" error reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(rename = "oldPath", skip_serializing_if = "String::is_empty")]
    pub old_path: String,

    #[serde(rename = "newPath", skip_serializing_if = "String::is_empty")]
    pub new_path: String,

    #[serde(rename = "newName", skip_serializing_if = "String::is_empty")]
    pub new_name: String,

    #[serde(skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(rename = "chunkIndex", skip_serializing_if = "is_zero")]
    pub chunk_index: u64,

    /// Raw payload bytes (upload blocks only)
    #[serde(with = "serde_bytes", skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<u8>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Message {
    /// Copy of this message with `content` cleared, for echoing back to the
    /// client without reflecting bulk payloads.
    pub fn stripped(&self) -> Message {
        Message {
            content: Vec::new(),
            ..self.clone()
        }
    }
}

/// One directory entry in a `listDir` reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

/// Response envelope sent by the daemon
///
/// Always names its status (`success`/`error`) and echoes the originating
/// request so the client can correlate it. `error` is set on errors only;
/// `files`/`uuid` carry the `listDir`/`download` success payloads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Reply {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    pub req: Message,
}

impl Reply {
    /// Plain success acknowledging `req`
    pub fn success(req: &Message) -> Self {
        Reply {
            kind: "success".into(),
            error: None,
            files: None,
            uuid: None,
            req: req.stripped(),
        }
    }

    /// Error reply; `err` becomes the wire error payload
    pub fn error(err: impl std::fmt::Display, req: &Message) -> Self {
        Reply {
            kind: "error".into(),
            error: Some(err.to_string()),
            files: None,
            uuid: None,
            req: req.stripped(),
        }
    }

    /// `listDir` success carrying the filtered entries
    pub fn listing(files: Vec<FileEntry>, req: &Message) -> Self {
        Reply {
            files: Some(files),
            ..Reply::success(req)
        }
    }

    /// `download` success carrying the one-time token
    pub fn token(uuid: impl Into<String>, req: &Message) -> Self {
        Reply {
            uuid: Some(uuid.into()),
            ..Reply::success(req)
        }
    }
}

/// Encode a frame payload as MessagePack with field names preserved
pub fn to_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a frame payload from MessagePack
pub fn from_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message {
            kind: "uploadBlock".into(),
            path: "/srv/data/f.bin".into(),
            chunk_index: 3,
            content: vec![0xde, 0xad, 0xbe, 0xef],
            ..Default::default()
        };

        let bytes = to_msgpack(&msg).unwrap();
        let parsed: Message = from_msgpack(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_empty_fields_omitted() {
        let msg = Message {
            kind: "listDir".into(),
            path: "/srv".into(),
            ..Default::default()
        };

        let bytes = to_msgpack(&msg).unwrap();
        assert!(contains(&bytes, b"type"));
        assert!(contains(&bytes, b"path"));
        assert!(!contains(&bytes, b"newName"));
        assert!(!contains(&bytes, b"chunkIndex"));
        assert!(!contains(&bytes, b"content"));
    }

    #[test]
    fn test_field_names_on_wire() {
        let msg = Message {
            kind: "rename".into(),
            path: "/srv/a".into(),
            old_path: "/srv/a".into(),
            new_path: "/srv/b".into(),
            new_name: "b".into(),
            ..Default::default()
        };

        let bytes = to_msgpack(&msg).unwrap();
        assert!(contains(&bytes, b"oldPath"));
        assert!(contains(&bytes, b"newPath"));
        assert!(contains(&bytes, b"newName"));
    }

    #[test]
    fn test_missing_fields_decode_to_defaults() {
        let partial = Message {
            kind: "delete".into(),
            path: "/srv/x".into(),
            ..Default::default()
        };

        let bytes = to_msgpack(&partial).unwrap();
        let parsed: Message = from_msgpack(&bytes).unwrap();
        assert_eq!(parsed.size, 0);
        assert!(parsed.content.is_empty());
        assert!(parsed.new_name.is_empty());
    }

    #[test]
    fn test_reply_strips_content() {
        let req = Message {
            kind: "uploadBlock".into(),
            path: "/srv/f".into(),
            content: vec![1, 2, 3],
            ..Default::default()
        };

        let reply = Reply::success(&req);
        assert_eq!(reply.kind, "success");
        assert!(reply.req.content.is_empty());
        assert_eq!(reply.req.path, "/srv/f");

        let bytes = to_msgpack(&reply).unwrap();
        assert!(!contains(&bytes, b"content"));
        assert!(!contains(&bytes, b"error"));
    }

    #[test]
    fn test_error_reply() {
        let req = Message {
            kind: "delete".into(),
            ..Default::default()
        };

        let reply = Reply::error("path missing", &req);
        let bytes = to_msgpack(&reply).unwrap();
        let parsed: Reply = from_msgpack(&bytes).unwrap();
        assert_eq!(parsed.kind, "error");
        assert_eq!(parsed.error.as_deref(), Some("path missing"));
        assert_eq!(parsed.req.kind, "delete");
    }

    #[test]
    fn test_listing_reply() {
        let req = Message {
            kind: "listDir".into(),
            path: "/srv".into(),
            ..Default::default()
        };
        let entries = vec![FileEntry {
            name: "data".into(),
            path: "/srv/data".into(),
            is_dir: true,
        }];

        let bytes = to_msgpack(&Reply::listing(entries, &req)).unwrap();
        assert!(contains(&bytes, b"isDir"));

        let parsed: Reply = from_msgpack(&bytes).unwrap();
        let files = parsed.files.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_dir);
    }

    #[test]
    fn test_token_reply() {
        let req = Message {
            kind: "download".into(),
            path: "/srv/report.pdf".into(),
            ..Default::default()
        };

        let parsed: Reply =
            from_msgpack(&to_msgpack(&Reply::token("ab-12", &req)).unwrap()).unwrap();
        assert_eq!(parsed.uuid.as_deref(), Some("ab-12"));
        assert!(parsed.error.is_none());
    }
}
