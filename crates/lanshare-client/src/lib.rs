//! Client-side engine for the shared note store.
//!
//! Everything a UI needs to talk to a `lanshared` server: a [`Session`]
//! that connects, reconnects, and merges snapshots; optimistic local
//! application of intents so edits render before the server answers; a
//! per-endpoint cache so the world survives restarts; and editor timing
//! helpers (autosave, remote-apply suppression, caret remapping).

pub mod cache;
pub mod editing;
pub mod optimistic;
pub mod session;

pub use cache::{CacheError, CachedState, ClientCache};
pub use session::{
    ReconnectConfig, ReconnectState, RenderHint, Session, SessionError, SessionEvent, SessionState,
};
