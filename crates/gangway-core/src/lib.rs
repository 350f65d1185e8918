//! Gangway Core - Protocol types and policy for the gateway daemon
//!
//! This crate holds everything the daemon needs that is not tied to a live
//! socket:
//! - The wire envelope exchanged with browser clients (MessagePack-encoded
//!   frames with field names preserved)
//! - The path access-control predicate that bounds filesystem reachability
//! - Operation error types whose display text is the wire error payload
//! - Daemon configuration (TOML file and/or CLI overrides)
//!
//! # Protocol
//!
//! Every capability session speaks the same shape: one binary frame carries
//! one [`Message`] from the client, and the daemon answers with one
//! [`Reply`] that echoes the request (minus any bulk `content`) so clients
//! can correlate responses without a request-id scheme.

pub mod access;
pub mod config;
pub mod error;
pub mod message;

pub use access::{absolutize, PathAccess};
pub use config::{ConfigError, GatewayConfig, TerminalConfig};
pub use error::OpError;
pub use message::{from_msgpack, to_msgpack, FileEntry, Message, Reply};

/// Maximum length of a single path name component (bytes)
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a full path (bytes)
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum declared size of a single upload (4 GiB)
pub const MAX_UPLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum raw content bytes in one upload block (5 MiB)
pub const MAX_UPLOAD_BLOCK_SIZE: usize = 5 * 1024 * 1024;

/// Maximum encoded size of one session frame (8 MiB)
///
/// Large enough for a full upload block plus envelope overhead; anything
/// bigger is a protocol violation, not a bigger transfer.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Maximum concurrently admitted sessions across all capabilities
pub const MAX_SESSIONS: usize = 128;
