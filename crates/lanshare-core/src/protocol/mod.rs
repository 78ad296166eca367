//! Wire protocol between clients and the authoritative server.
//!
//! Everything travels as JSON text frames shaped `{"type": ..., "payload": ...}`.
//! Both directions are modeled as tagged unions so payloads are typed and
//! malformed frames are rejected at the decode boundary instead of being
//! duck-typed into handlers. Callers ignore rejected frames; nothing on the
//! wire can crash the process.

pub mod intent;
pub mod message;

pub use intent::{InsertPosition, Intent};
pub use message::ServerMessage;

use thiserror::Error;

/// Maximum message size (50MB) to prevent memory exhaustion from hostile
/// or broken peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
