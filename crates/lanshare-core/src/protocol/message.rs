//! Server→client messages.
//!
//! The server pushes whole-world snapshots (`full_sync`), presence updates,
//! and a one-time greeting; there are no per-operation replies.

use crate::model::Document;
use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The entire current store. Sent to a client immediately on connect and
    /// broadcast to everyone after each state-changing intent. There are no
    /// deltas; receivers replace their world.
    FullSync(Document),
    /// Greeting sent once, before the first `full_sync`.
    #[serde(rename_all = "camelCase")]
    You {
        client_id: String,
        is_host: bool,
        online_client_ids: Vec<String>,
    },
    /// Presence change: someone connected or disconnected.
    #[serde(rename_all = "camelCase")]
    ClientsChanged { online_client_ids: Vec<String> },
    /// The shared-files collection changed (emitted by the upload endpoints).
    FilesUpdated,
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization should not fail")
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
