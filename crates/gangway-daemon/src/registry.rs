//! Session registry and admission control
//!
//! Every accepted WebSocket connection reserves a slot here before any
//! traffic flows and releases it when the handler returns. Slots are a hard
//! cap: at capacity the gateway turns connections away rather than queueing
//! them. Shutdown waits on [`Registry::drain`] until the last slot is free.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use gangway_core::MAX_SESSIONS;

/// Which endpoint a session is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    FileManager,
    Terminal,
    Notification,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::FileManager => write!(f, "file manager"),
            SessionKind::Terminal => write!(f, "terminal"),
            SessionKind::Notification => write!(f, "notification"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("session table full ({0} active)")]
    AtCapacity(usize),
}

struct RegistryInner {
    sessions: Mutex<HashMap<u64, SessionKind>>,
    next_id: AtomicU64,
    capacity: usize,
    drained: Notify,
}

/// Shared session table; cloning hands out another handle to the same table
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity,
                drained: Notify::new(),
            }),
        }
    }

    /// Reserve a slot. Session ids are monotonic and never reused, so logs
    /// from different connections never collide.
    pub fn reserve(&self, kind: SessionKind) -> Result<SessionGuard, AdmissionError> {
        let id = {
            let mut sessions = self.inner.sessions.lock();
            if sessions.len() >= self.inner.capacity {
                return Err(AdmissionError::AtCapacity(sessions.len()));
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            sessions.insert(id, kind);
            id
        };
        info!(conn = id, "registered {} session", kind);
        Ok(SessionGuard {
            inner: Arc::clone(&self.inner),
            id,
            kind,
        })
    }

    pub fn active(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Resolve once the table is empty. Returns immediately when nothing is
    /// registered; otherwise waits for the releases, however they happen.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a release between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if self.inner.sessions.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one registered slot; dropping it releases the slot. Release is
/// idempotent by construction since the guard can only drop once.
pub struct SessionGuard {
    inner: Arc<RegistryInner>,
    id: u64,
    kind: SessionKind,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self.inner.sessions.lock().remove(&self.id).is_some();
        if removed {
            debug!(conn = self.id, "released {} session", self.kind);
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let registry = Registry::new();
        let a = registry.reserve(SessionKind::FileManager).unwrap();
        let b = registry.reserve(SessionKind::Terminal).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);

        drop(a);
        drop(b);

        // Fresh sessions keep counting upward.
        let c = registry.reserve(SessionKind::FileManager).unwrap();
        assert_eq!(c.id(), 3);
    }

    #[test]
    fn test_capacity_is_enforced_and_release_frees_one_slot() {
        let registry = Registry::with_capacity(2);
        let a = registry.reserve(SessionKind::FileManager).unwrap();
        let _b = registry.reserve(SessionKind::FileManager).unwrap();

        assert!(matches!(
            registry.reserve(SessionKind::Terminal),
            Err(AdmissionError::AtCapacity(2))
        ));

        drop(a);
        assert_eq!(registry.active(), 1);
        let _c = registry.reserve(SessionKind::Terminal).unwrap();
        assert_eq!(registry.active(), 2);
    }

    #[test]
    fn test_guard_reports_kind() {
        let registry = Registry::new();
        let guard = registry.reserve(SessionKind::Notification).unwrap();
        assert_eq!(guard.kind(), SessionKind::Notification);
        assert_eq!(guard.kind().to_string(), "notification");
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_empty() {
        let registry = Registry::new();
        tokio::time::timeout(Duration::from_secs(1), registry.drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_release() {
        let registry = Registry::new();
        let guard = registry.reserve(SessionKind::FileManager).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(2), registry.drain())
            .await
            .unwrap();
        assert_eq!(registry.active(), 0);
        release.await.unwrap();
    }
}
