//! The client session.
//!
//! One `Session` per server endpoint. The session owns the local document
//! copy, the offline queue, the order overlay, and the reconciler, and
//! mutates them only inside [`Session::poll_event`] and
//! [`Session::submit`]; the WebSocket read half lives on a spawned task
//! that forwards text frames over an mpsc channel. Reconnection uses
//! attempt-counted exponential backoff, and the offline queue is flushed
//! on every successful connect.

use crate::cache::{CacheError, CachedState, ClientCache};
use crate::editing::{ReorderEcho, same_order};
use crate::optimistic;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use lanshare_core::{
    Document, IdRemap, Intent, MAX_MESSAGE_SIZE, OfflineQueue, OrderOverlay, ReconcileOutcome,
    Reconciler, ServerMessage, Timestamp,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// State of a session's connection to its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// First connection attempt in progress
    Connecting,
    /// Connected; frames flow
    Open,
    /// Disconnected, waiting out the backoff timer
    Reconnecting,
    /// Permanently closed (no reconnect)
    Closed,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping for one endpoint.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Number of reconnection attempts
    pub attempts: u32,
    /// When to attempt next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_attempt_at: None,
            current_delay: Duration::from_secs(3),
        }
    }

    /// Schedule the next reconnection attempt.
    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
        self.current_delay = Duration::from_secs(3);
    }

    /// Is it time to try again?
    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.map(|t| now_ms >= t).unwrap_or(false)
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the UI should repaint after a sync.
///
/// `SkipEcho` marks a snapshot that arrived within the reorder-echo window
/// and changed no ordering; rendering it would only flicker the list the
/// user just dragged. State is persisted either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderHint {
    Paint,
    SkipEcho,
}

/// What the session surfaces to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The server's greeting: who we are on this connection.
    You {
        client_id: String,
        is_host: bool,
        online_client_ids: Vec<String>,
    },
    /// Presence change on the server.
    ClientsChanged { online_client_ids: Vec<String> },
    /// A snapshot was merged into the local document.
    Updated {
        remap: IdRemap,
        render_hint: RenderHint,
    },
    /// The server's shared-files collection changed.
    FilesUpdated,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What the read task forwards to the session.
enum TransportEvent {
    Frame(String),
    Closed,
}

/// A live (or trying-to-be-live) connection to one server, plus all the
/// client-side state that must survive it dying.
pub struct Session {
    endpoint: String,
    cache: ClientCache,
    document: Document,
    queue: OfflineQueue,
    overlay: OrderOverlay,
    reconciler: Reconciler,
    reorder_echo: ReorderEcho,
    state: SessionState,
    client_id: Option<String>,
    is_host: bool,
    config: ReconnectConfig,
    reconnect: ReconnectState,
    write: Option<
        Arc<Mutex<futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>,
    >,
    read_task: Option<JoinHandle<()>>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Session {
    /// Create a session for `endpoint` (a `host:port` pair), restoring the
    /// last cached snapshot, queue, and overlay for it. Does not connect;
    /// the first [`Session::poll_event`] call does.
    pub fn new(
        endpoint: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, SessionError> {
        let endpoint = endpoint.into();
        let cache = ClientCache::new(cache_dir);
        let cached = cache.load(&endpoint)?;
        // Placeholder channel until the first connect installs a real one.
        let (_tx, transport_rx) = mpsc::unbounded_channel();
        Ok(Self {
            endpoint,
            cache,
            document: cached.snapshot,
            queue: cached.queue,
            overlay: cached.overlay,
            reconciler: Reconciler::default(),
            reorder_echo: ReorderEcho::default(),
            state: SessionState::Connecting,
            client_id: None,
            is_host: false,
            config: ReconnectConfig::default(),
            reconnect: ReconnectState::new(),
            write: None,
            read_task: None,
            transport_rx,
        })
    }

    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The local view of the world, temp entities included.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Our server-assigned connection id, once the greeting arrived.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Drive the session: connect (or reconnect) when due, then surface the
    /// next event. Returns `None` once the session is closed.
    ///
    /// Suspension points are the backoff timer, connects, sends, and frame
    /// receipt; dropping the future mid-await leaves the session consistent
    /// and resumable.
    pub async fn poll_event(&mut self) -> Option<SessionEvent> {
        loop {
            match self.state {
                SessionState::Closed => return None,
                SessionState::Connecting | SessionState::Reconnecting => {
                    if let Some(at) = self.reconnect.next_attempt_at {
                        let now = now_ms();
                        if at > now {
                            tokio::time::sleep(Duration::from_millis(at - now)).await;
                        }
                    }
                    match self.try_connect().await {
                        Ok(()) => {
                            info!("Connected to {}", self.endpoint);
                            self.state = SessionState::Open;
                            return Some(SessionEvent::StateChanged(SessionState::Open));
                        }
                        Err(e) => {
                            warn!("Failed to connect to {}: {}", self.endpoint, e);
                            self.reconnect.schedule_reconnect(now_ms(), &self.config);
                            if self.reconnect.exceeded_max_attempts(&self.config) {
                                info!(
                                    "Giving up on {} after {} attempts",
                                    self.endpoint, self.reconnect.attempts
                                );
                                self.state = SessionState::Closed;
                                return Some(SessionEvent::StateChanged(SessionState::Closed));
                            }
                            if self.state != SessionState::Reconnecting {
                                self.state = SessionState::Reconnecting;
                                return Some(SessionEvent::StateChanged(
                                    SessionState::Reconnecting,
                                ));
                            }
                        }
                    }
                }
                SessionState::Open => match self.transport_rx.recv().await {
                    Some(TransportEvent::Frame(text)) => {
                        if let Some(event) = self.on_frame(&text).await {
                            return Some(event);
                        }
                    }
                    Some(TransportEvent::Closed) | None => {
                        info!("Connection to {} lost", self.endpoint);
                        self.drop_transport();
                        self.state = SessionState::Reconnecting;
                        self.reconnect.schedule_reconnect(now_ms(), &self.config);
                        return Some(SessionEvent::StateChanged(SessionState::Reconnecting));
                    }
                },
            }
        }
    }

    /// Apply a local mutation and get it to the server.
    ///
    /// While open, the intent is sent as-is and the echoed snapshot carries
    /// the authoritative result, server-assigned ids included. Otherwise
    /// the mutation is applied optimistically to the local document (with a
    /// temp id for creates, which is returned) and non-creating intents are
    /// queued for replay; creating intents are not queued, because the
    /// reconciler re-sends them from the optimistic document itself and a
    /// queued copy would create the entity twice.
    pub async fn submit(&mut self, intent: Intent, now: Timestamp) -> Option<String> {
        self.note_order_gesture(&intent);

        if self.state == SessionState::Open {
            match self.send_text(&intent.encode()).await {
                Ok(()) => {
                    self.persist();
                    return None;
                }
                Err(e) => {
                    warn!(
                        "Send failed, handling {} as an offline edit: {}",
                        intent.kind(),
                        e
                    );
                }
            }
        }

        let minted = optimistic::apply_local(&mut self.document, &intent, now);
        if !is_create(&intent) {
            self.queue.push(intent, now);
        }
        self.persist();
        minted
    }

    /// Close for good: no reconnects, no more events.
    pub async fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(write) = &self.write {
            if let Ok(mut w) = write.try_lock() {
                let _ = w.send(Message::Close(None)).await;
            }
        }
        self.drop_transport();
    }

    async fn try_connect(&mut self) -> Result<(), WsError> {
        let url = format!("ws://{}", self.endpoint);
        let (ws_stream, _) = connect_async(&url).await?;

        let (write, read) = ws_stream.split();
        self.write = Some(Arc::new(Mutex::new(write)));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.transport_rx = event_rx;
        let endpoint = self.endpoint.clone();
        self.read_task = Some(tokio::spawn(async move {
            Self::read_loop(endpoint, read, event_tx).await;
        }));

        self.reconnect.reset();
        self.flush_queue().await;
        Ok(())
    }

    /// Read loop that forwards text frames to the session.
    async fn read_loop(
        endpoint: String,
        mut read: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Binary(data) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Dropping non-UTF-8 frame from {}", endpoint);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", endpoint);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            endpoint,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    let _ = event_tx.send(TransportEvent::Frame(text));
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", endpoint);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", endpoint, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} stream ended", endpoint);
                    break;
                }
            }
        }

        let _ = event_tx.send(TransportEvent::Closed);
    }

    /// Drain the offline queue over the live connection, oldest first.
    ///
    /// The queue is cleared before sending: delivery is at-most-once with
    /// no per-op ack, and a failed send drops the remainder rather than
    /// replaying it later.
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let items = self.queue.drain();
        info!("Flushing {} queued intents to {}", items.len(), self.endpoint);
        for queued in &items {
            if let Err(e) = self.send_text(&queued.intent.encode()).await {
                warn!("Stopped flushing queue after send failure: {}", e);
                break;
            }
        }
        self.persist();
    }

    async fn on_frame(&mut self, text: &str) -> Option<SessionEvent> {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed frame from {}: {}", self.endpoint, e);
                return None;
            }
        };
        match message {
            ServerMessage::You {
                client_id,
                is_host,
                online_client_ids,
            } => {
                debug!("Greeted by {} as {}", self.endpoint, client_id);
                self.client_id = Some(client_id.clone());
                self.is_host = is_host;
                Some(SessionEvent::You {
                    client_id,
                    is_host,
                    online_client_ids,
                })
            }
            ServerMessage::ClientsChanged { online_client_ids } => {
                Some(SessionEvent::ClientsChanged { online_client_ids })
            }
            ServerMessage::FilesUpdated => Some(SessionEvent::FilesUpdated),
            ServerMessage::FullSync(snapshot) => Some(self.on_full_sync(snapshot).await),
        }
    }

    /// Merge an incoming snapshot: reconcile temp entities, re-impose the
    /// order overlay, send whatever the reconcilation produced, persist.
    async fn on_full_sync(&mut self, snapshot: Document) -> SessionEvent {
        let now = now_ms();
        let ReconcileOutcome {
            document: mut merged,
            outgoing,
            remap,
        } = self.reconciler.reconcile(&self.document, snapshot, now);

        self.overlay.apply_remap(&remap);
        let correctives = self.overlay.merge(&mut merged);

        let render_hint = if self.reorder_echo.within_window(now)
            && same_order(&self.document, &merged)
        {
            RenderHint::SkipEcho
        } else {
            RenderHint::Paint
        };
        self.document = merged;

        // Resends and corrective reorders are best-effort: a failed send is
        // re-offered by the reconciler's cooldown on a later snapshot, not
        // queued.
        for intent in outgoing.iter().chain(correctives.iter()) {
            if let Err(e) = self.send_text(&intent.encode()).await {
                warn!("Dropped {} after send failure: {}", intent.kind(), e);
                break;
            }
        }

        self.persist();
        SessionEvent::Updated { remap, render_hint }
    }

    /// Record the ordering consequences of a local gesture.
    fn note_order_gesture(&mut self, intent: &Intent) {
        match intent {
            Intent::ReorderVolumes {
                group_id,
                new_order,
            } => {
                self.overlay.record_volume_order(group_id, new_order.clone());
                self.reorder_echo.note_reorder(now_ms());
            }
            Intent::ReorderEntries {
                group_id,
                volume_id,
                new_order,
            } => {
                self.overlay
                    .record_entry_order(group_id, volume_id, new_order.clone());
                self.reorder_echo.note_reorder(now_ms());
            }
            Intent::MoveEntry {
                group_id,
                from_volume_id,
                to_volume_id,
                entry_id,
                to_index,
            } => {
                // A move rewrites two volumes' orders. The document itself
                // is not mutated yet (while open it never is, the echoed
                // snapshot carries the result), so the post-move orders must
                // be derived from the intent, not read back from the tree.
                if let Some(group) = self.document.group(group_id) {
                    if let (Some(from), Some(to)) =
                        (group.volume(from_volume_id), group.volume(to_volume_id))
                    {
                        if from.entry_ids.iter().any(|id| id == entry_id) {
                            let from_ids: Vec<String> = from
                                .entry_ids
                                .iter()
                                .filter(|id| *id != entry_id)
                                .cloned()
                                .collect();
                            let mut to_ids = if from_volume_id == to_volume_id {
                                from_ids.clone()
                            } else {
                                to.entry_ids.clone()
                            };
                            let at = (*to_index).clamp(0, to_ids.len() as i64) as usize;
                            to_ids.insert(at, entry_id.clone());
                            self.overlay
                                .record_entry_order(group_id, from_volume_id, from_ids);
                            self.overlay
                                .record_entry_order(group_id, to_volume_id, to_ids);
                        }
                    }
                }
                self.reorder_echo.note_reorder(now_ms());
            }
            _ => {}
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), WsError> {
        let Some(write) = &self.write else {
            return Err(WsError::ConnectionClosed);
        };
        let mut w = write.lock().await;
        w.send(Message::Text(text.to_string())).await
    }

    fn persist(&self) {
        let state = CachedState {
            snapshot: self.document.clone(),
            queue: self.queue.clone(),
            overlay: self.overlay.clone(),
        };
        if let Err(e) = self.cache.save(&self.endpoint, &state) {
            error!("Failed to persist cache for {}: {}", self.endpoint, e);
        }
    }

    fn drop_transport(&mut self) {
        self.write = None;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Intents whose offline form is a temp entity the reconciler re-creates
/// from the document itself. Queuing these too would create the entity
/// twice on reconnect.
fn is_create(intent: &Intent) -> bool {
    matches!(
        intent,
        Intent::CreateGroup { .. }
            | Intent::CreateEntry { .. }
            | Intent::CreateEntryWithContent { .. }
            | Intent::CloneEntry { .. }
            | Intent::InsertEntry { .. }
            | Intent::CreateVolume { .. }
    )
}
