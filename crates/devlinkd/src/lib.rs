//! devlinkd - devlink peer connection daemon
//!
//! This daemon provides:
//! - Command-line configuration of the connection manager
//! - Persistent node identity and treated signaling messages (sled)
//! - A loopback self-test through a second in-process device
//! - Periodic connection status dumps

pub mod config;
pub mod server;
pub mod storage;

pub use config::{Config, NodeState};
pub use server::{Server, ServerError, ServerStats};
pub use storage::{Storage, StorageError};
