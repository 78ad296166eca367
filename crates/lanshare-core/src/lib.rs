//! Shared model and protocol for the lanshare collaborative note store.
//!
//! This crate holds everything both sides of the wire agree on: the
//! document tree (groups, volumes, entries), the intent and server message
//! codecs, and the client-side sync machinery that has to be testable
//! without a socket: the authoritative [`Store`], the [`Reconciler`] that
//! migrates offline temp entities onto server ids, the [`OrderOverlay`]
//! that defends local ordering, and the [`OfflineQueue`].

pub mod model;
pub mod overlay;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod temp_id;

pub use model::{Document, Entry, Group, Timestamp, Volume};
pub use overlay::OrderOverlay;
pub use protocol::{InsertPosition, Intent, ProtocolError, ServerMessage, MAX_MESSAGE_SIZE};
pub use queue::{OfflineQueue, QueuedIntent};
pub use reconcile::{IdRemap, ReconcileOutcome, ReconciliationKey, Reconciler};
pub use retry::{EntityKind, RetryGate};
pub use store::Store;
