//! Gangway Daemon - local-socket gateway for privileged host capabilities
//!
//! Browser clients reach the daemon through a single Unix socket and upgrade
//! to one WebSocket session per capability:
//!
//! 1. `/ws-filemanager` - typed file operations plus chunked uploads and
//!    token-based downloads
//! 2. `/ws-terminal` - an interactive shell on a pseudo-terminal
//! 3. `/ws-notification` - a feed of desktop notifications relayed from the
//!    session bus
//! 4. `/download/<token>` - plain one-shot HTTP redemption of a download
//!    token
//!
//! Every session is admitted by a capacity-capped registry and speaks the
//! same MessagePack frame protocol; shutdown is cooperative, draining live
//! sessions before the process exits.

pub mod cache;
pub mod channel;
pub mod download;
pub mod filemanager;
pub mod notification;
pub mod registry;
pub mod server;
pub mod terminal;
pub mod transfers;

pub use channel::MessageChannel;
pub use registry::{Registry, SessionGuard, SessionKind};
pub use server::Gateway;
pub use transfers::TransferTable;

/// How long shutdown waits for live sessions to drain before giving up
pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);
