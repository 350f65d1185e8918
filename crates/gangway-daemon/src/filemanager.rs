//! File manager endpoint
//!
//! One session is one request/reply loop: decode a frame, run the operation,
//! send back a reply echoing the request. Filesystem work happens inline on
//! the session task; operations are short and upload payloads arrive in
//! bounded blocks, so a slow disk stalls only its own session.
//!
//! Every operation consults the access policy first and reports a refused
//! path as missing, so probing the tree outside the allowed roots tells a
//! client nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gangway_core::{
    absolutize, FileEntry, Message, OpError, PathAccess, Reply, MAX_NAME_LEN, MAX_PATH_LEN,
    MAX_UPLOAD_BLOCK_SIZE, MAX_UPLOAD_SIZE,
};

use crate::channel::MessageChannel;
use crate::transfers::{PendingUpload, TransferTable};

/// Handles every file-manager session against one shared policy and
/// transfer table
pub struct FileManager {
    access: Arc<PathAccess>,
    transfers: Arc<TransferTable>,
}

impl FileManager {
    pub fn new(access: Arc<PathAccess>, transfers: Arc<TransferTable>) -> Self {
        Self { access, transfers }
    }

    /// Drive one session until the peer leaves or shutdown is requested.
    /// Uploads left unfinished by this session are reclaimed on the way out.
    pub async fn run<S>(&self, ws: WebSocketStream<S>, session: u64, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = MessageChannel::new(ws);

        // No read deadline here: an idle file-manager client may sit on its
        // connection for as long as it likes.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    channel.close("Connection closing").await;
                    break;
                }
                received = channel.recv() => match received {
                    Ok(Some(msg)) => {
                        let reply = self.handle(session, &msg);
                        if let Err(e) = channel.send(&reply).await {
                            warn!(conn = session, "reply failed: {}", e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = session, "session failed: {}", e);
                        break;
                    }
                }
            }
        }

        let purged = self.transfers.purge_session_uploads(session);
        if purged > 0 {
            debug!(conn = session, "dropped {} unfinished uploads", purged);
        }
    }

    /// Run one operation and build its reply. Never fails: operation errors
    /// become error replies carrying the wire error text.
    pub fn handle(&self, session: u64, msg: &Message) -> Reply {
        let result = match msg.kind.as_str() {
            "listDir" => self.list_dir(msg),
            "rename" => self.rename(msg),
            "delete" => self.delete(msg),
            "createFolder" => self.create_folder(msg),
            "upload" => self.upload(session, msg),
            "uploadBlock" => self.upload_block(msg),
            "cancelUpload" => self.cancel_upload(msg),
            "download" => self.download(msg),
            _ => Err(OpError::UnknownType),
        };
        result.unwrap_or_else(|e| {
            debug!(conn = session, op = %msg.kind, "refused: {}", e);
            Reply::error(e, msg)
        })
    }

    fn checked_path(&self, raw: &str) -> Result<PathBuf, OpError> {
        if raw.is_empty() {
            return Err(OpError::PathMissing);
        }
        if raw.len() > MAX_PATH_LEN {
            return Err(OpError::PathTooLong);
        }
        Ok(absolutize(Path::new(raw)))
    }

    fn list_dir(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if !self.access.is_listable(&path, true) {
            return Err(OpError::NotFound);
        }

        let mut total = 0usize;
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            total += 1;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let entry_path = path.join(entry.file_name());
            if !self.access.is_listable(&entry_path, is_dir) {
                continue;
            }
            files.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry_path.to_string_lossy().into_owned(),
                is_dir,
            });
        }

        // A listing the policy emptied out must look exactly like a missing
        // directory.
        if total > 0 && files.is_empty() {
            return Err(OpError::NotFound);
        }

        files.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(Reply::listing(files, msg))
    }

    fn rename(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if msg.new_name.is_empty() {
            return Err(OpError::NameMissing);
        }
        if msg.new_name.len() > MAX_NAME_LEN {
            return Err(OpError::NameTooLong);
        }
        if !self.access.is_allowed(&path) {
            return Err(OpError::NotFound);
        }
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        let target = absolutize(&parent.join(&msg.new_name));
        if !self.access.is_allowed(&target) {
            return Err(OpError::NotFound);
        }
        std::fs::rename(&path, &target)?;
        Ok(Reply::success(msg))
    }

    fn delete(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if !self.access.is_allowed(&path) {
            return Err(OpError::NotFound);
        }
        // Symlinks are removed as links, never followed into their target.
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(Reply::success(msg))
    }

    fn create_folder(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if !self.access.is_allowed(&path) {
            // Top-level refusals read as permission problems; deeper ones
            // stay indistinguishable from a missing parent.
            let at_root = path.parent().map_or(true, |p| p == Path::new("/"));
            return Err(if at_root {
                OpError::PermissionDenied
            } else {
                OpError::NotFound
            });
        }
        std::fs::create_dir(&path)?;
        Ok(Reply::success(msg))
    }

    fn upload(&self, session: u64, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if msg.size == 0 {
            return Err(OpError::SizeMissing);
        }
        if msg.size > MAX_UPLOAD_SIZE {
            return Err(OpError::SizeTooBig);
        }
        if !self.access.is_allowed(&path) {
            return Err(OpError::NotFound);
        }
        self.transfers.check_upload_slot(&path)?;
        match std::fs::metadata(&path) {
            Ok(_) => return Err(OpError::AlreadyExists),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let upload = Arc::new(PendingUpload::new(session, path.clone(), msg.size, file));
        if let Err(e) = self.transfers.register_upload(path, upload.clone()) {
            upload.discard();
            return Err(e);
        }
        Ok(Reply::success(msg))
    }

    fn upload_block(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if msg.content.is_empty() {
            return Err(OpError::DataMissing);
        }
        if msg.content.len() > MAX_UPLOAD_BLOCK_SIZE {
            return Err(OpError::DataTooBig);
        }
        let upload = self
            .transfers
            .lookup_upload(&path)
            .ok_or(OpError::TransferNotFound)?;
        match upload.append(&msg.content) {
            Ok(received) if received == upload.declared_size() => {
                // Completion is a side effect of the last block. Closing the
                // handle first keeps the eviction hook from deleting the
                // finished file.
                upload.complete();
                self.transfers.remove_upload(&path);
                debug!("upload finished: {:?}", path);
                Ok(Reply::success(msg))
            }
            Ok(_) => Ok(Reply::success(msg)),
            Err(e) => {
                // A bad block ends the whole transfer, whether it overflowed
                // the declared size or the disk failed.
                self.transfers.remove_upload(&path);
                Err(e)
            }
        }
    }

    fn cancel_upload(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if self.transfers.remove_upload(&path) {
            Ok(Reply::success(msg))
        } else {
            Err(OpError::TransferNotFound)
        }
    }

    fn download(&self, msg: &Message) -> Result<Reply, OpError> {
        let path = self.checked_path(&msg.path)?;
        if !self.access.is_allowed(&path) {
            return Err(OpError::NotFound);
        }
        let meta = std::fs::metadata(&path)?;
        if meta.is_dir() {
            return Err(OpError::IsDirectory);
        }
        let token = self.transfers.create_download_token(path)?;
        Ok(Reply::token(token, msg))
    }
}
