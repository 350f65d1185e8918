//! Pending uploads and one-time download tokens
//!
//! Both tables are small and short-lived by design: a transfer slot reserves
//! a destination path (uploads) or grants one read of a source file
//! (downloads), and either reservation evaporates on its own if the client
//! stalls. Clients that hit the slot limit are told so and must retry.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use gangway_core::OpError;

use crate::cache::{ExpiringCache, InsertError};

/// Maximum simultaneous pending uploads
pub const MAX_PENDING_UPLOADS: usize = 5;

/// How long an upload may keep its destination path reserved. Deliberately
/// measured from creation, not last progress.
pub const UPLOAD_TTL: Duration = Duration::from_secs(10);

/// Maximum simultaneous unredeemed download tokens
pub const MAX_PENDING_DOWNLOADS: usize = 5;

/// How long a download token stays redeemable
pub const DOWNLOAD_TTL: Duration = Duration::from_secs(20);

/// Interval between expiry sweeps
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// An upload in progress: the destination file is created up front and
/// filled block by block.
pub struct PendingUpload {
    session: u64,
    path: PathBuf,
    declared_size: u64,
    state: Mutex<UploadState>,
}

struct UploadState {
    file: Option<File>,
    received: u64,
}

impl PendingUpload {
    pub fn new(session: u64, path: PathBuf, declared_size: u64, file: File) -> Self {
        Self {
            session,
            path,
            declared_size,
            state: Mutex::new(UploadState {
                file: Some(file),
                received: 0,
            }),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn received(&self) -> u64 {
        self.state.lock().received
    }

    /// Append one block, returning the total received afterwards. A block
    /// that would push the total past the declared size is refused before
    /// anything is written.
    pub fn append(&self, data: &[u8]) -> Result<u64, OpError> {
        let mut state = self.state.lock();
        let received = state.received;
        if received + data.len() as u64 > self.declared_size {
            return Err(OpError::TooMuchData);
        }
        let file = state.file.as_mut().ok_or(OpError::TransferNotFound)?;
        file.write_all(data)?;
        state.received = received + data.len() as u64;
        Ok(state.received)
    }

    /// Close the handle, keeping the file on disk. After this, a later
    /// [`discard`](Self::discard) is a no-op, which is what lets completion
    /// remove the cache entry without the eviction hook deleting the result.
    pub fn complete(&self) {
        self.state.lock().file = None;
    }

    /// Close the handle and delete the partial file. Safe to call any number
    /// of times; only the first call with a live handle does anything.
    pub fn discard(&self) {
        let file = self.state.lock().file.take();
        if file.is_some() {
            drop(file);
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed partial upload {:?}", self.path),
                Err(e) => warn!("failed to remove partial upload {:?}: {}", self.path, e),
            }
        }
    }
}

/// The two transfer tables shared by every file-manager session
pub struct TransferTable {
    uploads: ExpiringCache<PathBuf, Arc<PendingUpload>>,
    downloads: ExpiringCache<String, PathBuf>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::with_limits(
            MAX_PENDING_UPLOADS,
            UPLOAD_TTL,
            MAX_PENDING_DOWNLOADS,
            DOWNLOAD_TTL,
        )
    }

    /// Custom limits, used by tests to exercise expiry without waiting out
    /// the real deadlines.
    pub fn with_limits(
        upload_slots: usize,
        upload_ttl: Duration,
        download_slots: usize,
        download_ttl: Duration,
    ) -> Self {
        let uploads = ExpiringCache::with_evict_hook(
            upload_slots,
            upload_ttl,
            Box::new(|path: &PathBuf, upload: &Arc<PendingUpload>| {
                debug!("dropping pending upload for {:?}", path);
                upload.discard();
            }),
        );
        let downloads = ExpiringCache::new(download_slots, download_ttl);
        Self { uploads, downloads }
    }

    /// Pre-flight for `upload`: refuse when all slots are taken or the
    /// destination already has an upload pending. Checked again atomically
    /// at [`register_upload`](Self::register_upload); this early check exists
    /// so validation fails before the destination file is created.
    pub fn check_upload_slot(&self, path: &Path) -> Result<(), OpError> {
        self.uploads.purge_expired();
        if self.uploads.contains(&path.to_path_buf()) {
            return Err(OpError::UploadInProgress);
        }
        if self.uploads.len() >= self.uploads.capacity() {
            return Err(OpError::TooManyTransfers);
        }
        Ok(())
    }

    /// Register a validated upload. The destination file must already be
    /// created; on failure the caller still owns it and must discard.
    pub fn register_upload(
        &self,
        path: PathBuf,
        upload: Arc<PendingUpload>,
    ) -> Result<(), OpError> {
        self.uploads.insert(path, upload).map_err(|e| match e {
            InsertError::Full => OpError::TooManyTransfers,
            InsertError::Occupied => OpError::UploadInProgress,
        })
    }

    /// Look up a live upload; expired entries have already been reclaimed.
    pub fn lookup_upload(&self, path: &Path) -> Option<Arc<PendingUpload>> {
        self.uploads.get(&path.to_path_buf())
    }

    /// Drop an upload entry, reclaiming the partial file unless it was
    /// completed first.
    pub fn remove_upload(&self, path: &Path) -> bool {
        self.uploads.remove(&path.to_path_buf())
    }

    /// Drop every upload owned by a closing session, regardless of TTL.
    pub fn purge_session_uploads(&self, session: u64) -> usize {
        self.uploads.remove_where(|_, u| u.session() == session)
    }

    /// Mint a one-time download token for `path`. A path with a live token
    /// keeps its reservation until redeemed or expired.
    pub fn create_download_token(&self, path: PathBuf) -> Result<String, OpError> {
        if self.downloads.any(|_, p| *p == path) {
            return Err(OpError::DownloadInProgress);
        }
        let token = Uuid::new_v4().to_string();
        self.downloads
            .insert(token.clone(), path)
            .map_err(|_| OpError::TooManyTransfers)?;
        Ok(token)
    }

    /// Redeem a token, consuming it. A second redemption finds nothing.
    pub fn redeem_download_token(&self, token: &str) -> Option<PathBuf> {
        self.downloads.take(&token.to_string())
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn pending_downloads(&self) -> usize {
        self.downloads.len()
    }

    /// Periodic expiry sweep; stops when `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let swept =
                            table.uploads.purge_expired() + table.downloads.purge_expired();
                        if swept > 0 {
                            debug!("expired {} transfer entries", swept);
                        }
                    }
                }
            }
            debug!("transfer reaper stopped");
        })
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}
