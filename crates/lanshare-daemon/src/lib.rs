//! lanshare-daemon library: exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components, allowing
//! integration tests (and embedding shells) to access internal types.

pub mod connection;
pub mod daemon;
pub mod server;
pub mod storage;

// Re-export key types for convenience
pub use connection::{ClientConnection, ConnectionEvent, IncomingFrame};
pub use daemon::{Daemon, DaemonHandle};
pub use server::{ServerEvent, WsServer};
pub use storage::{DocumentStorage, StorageError};
