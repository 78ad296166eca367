//! Daemon event loop.
//!
//! A single `tokio::select!` loop owns the authoritative [`Store`]: intents
//! apply strictly one at a time in arrival order across all connections, so
//! no intent ever observes a partially-applied sibling. Every state change
//! schedules a persistence write and a `full_sync` broadcast; writes are
//! coalesced so at most one is in flight with at most one more pending.

use crate::connection::IncomingFrame;
use crate::server::{ServerEvent, WsServer};
use crate::storage::DocumentStorage;
use anyhow::Result;
use chrono::Utc;
use lanshare_core::{Intent, ServerMessage, Store};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// External commands for collaborators outside the event loop, such as the
/// file upload endpoints announcing share changes.
#[derive(Debug)]
pub enum DaemonCommand {
    /// Broadcast `files_updated` to every client.
    FilesUpdated,
}

/// Handle for driving a running daemon from outside the event loop.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    command_tx: mpsc::UnboundedSender<DaemonCommand>,
}

impl DaemonHandle {
    /// Announce that shared files changed on the host.
    pub fn notify_files_updated(&self) {
        let _ = self.command_tx.send(DaemonCommand::FilesUpdated);
    }
}

/// Daemon state holding all components.
pub struct Daemon {
    /// The authoritative store
    store: Store,
    /// Durable storage for the document
    storage: DocumentStorage,
    /// WebSocket server
    server: WsServer,
    /// External command channel
    command_rx: mpsc::UnboundedReceiver<DaemonCommand>,
    /// Completion signal from the persistence task
    save_tx: mpsc::UnboundedSender<()>,
    save_rx: mpsc::UnboundedReceiver<()>,
    /// Whether a write is currently in flight
    save_in_flight: bool,
    /// Whether another write must follow the in-flight one
    save_pending: bool,
}

impl Daemon {
    /// Load the document, repair it, and rewrite the file so the on-disk
    /// shape is normalized before any client connects.
    pub fn new(storage: DocumentStorage) -> Result<(Self, DaemonHandle)> {
        let document = storage.load_or_default()?;
        let mut store = Store::new(document);
        if store.repair() {
            info!("Repaired volume structure on load");
        }
        storage.save(store.document())?;
        info!(
            "Database loaded from {:?} ({} group(s))",
            storage.path(),
            store.document().groups.len()
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (save_tx, save_rx) = mpsc::unbounded_channel();

        let daemon = Self {
            store,
            storage,
            server: WsServer::new(),
            command_rx,
            save_tx,
            save_rx,
            save_in_flight: false,
            save_pending: false,
        };
        Ok((daemon, DaemonHandle { command_tx }))
    }

    /// Run the main event loop until shutdown.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                // Accept new WebSocket connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Some(client_id) =
                                self.server.accept_connection(stream, addr).await
                            {
                                self.greet_client(&client_id).await;
                            }
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // Handle WebSocket events (frames, disconnects)
                Some(event) = self.server.poll_event() => {
                    match event {
                        ServerEvent::Frame(frame) => {
                            self.on_frame(frame).await;
                        }
                        ServerEvent::ClientDisconnected { client_id } => {
                            info!("Client disconnected: {}", client_id);
                            self.broadcast_roster().await;
                        }
                    }
                }

                // Handle external commands
                Some(command) = self.command_rx.recv() => {
                    match command {
                        DaemonCommand::FilesUpdated => {
                            debug!("Relaying files_updated");
                            self.server
                                .broadcast(&ServerMessage::FilesUpdated.encode())
                                .await;
                        }
                    }
                }

                // Handle persistence completions
                Some(()) = self.save_rx.recv() => {
                    self.on_save_done();
                }

                // Handle graceful shutdown
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Drain the in-flight write, then flush anything still pending.
        if self.save_in_flight {
            let _ = self.save_rx.recv().await;
            self.save_in_flight = false;
        }
        if self.save_pending {
            self.save_pending = false;
            self.storage.save(self.store.document())?;
        }
        info!("Shutting down");
        Ok(())
    }

    /// Send the `you` greeting and an immediate snapshot to a new client,
    /// then tell everyone the roster changed.
    async fn greet_client(&mut self, client_id: &str) {
        let you = ServerMessage::You {
            client_id: client_id.to_string(),
            is_host: self.server.is_host(client_id),
            online_client_ids: self.server.connected_client_ids(),
        };
        if let Err(e) = self.server.send(client_id, &you.encode()).await {
            error!("Failed to greet {}: {}", client_id, e);
            return;
        }

        // Connect is the one unconditional snapshot send.
        let snapshot = ServerMessage::FullSync(self.store.document().clone());
        if let Err(e) = self.server.send(client_id, &snapshot.encode()).await {
            error!("Failed to send snapshot to {}: {}", client_id, e);
        }

        self.broadcast_roster().await;
    }

    /// Apply one intent frame; broadcast and persist only when state changed.
    async fn on_frame(&mut self, frame: IncomingFrame) {
        let intent = match Intent::decode(&frame.text) {
            Ok(intent) => intent,
            Err(e) => {
                warn!("Ignoring malformed intent from {}: {}", frame.client_id, e);
                return;
            }
        };

        debug!("{} from {}", intent.kind(), frame.client_id);
        let changed = self.store.apply(intent, Utc::now());
        if changed {
            self.schedule_save();
            self.broadcast_snapshot().await;
        }
    }

    async fn broadcast_snapshot(&self) {
        let snapshot = ServerMessage::FullSync(self.store.document().clone());
        self.server.broadcast(&snapshot.encode()).await;
        debug!(
            "Broadcast snapshot to {} client(s)",
            self.server.client_count()
        );
    }

    async fn broadcast_roster(&self) {
        let roster = ServerMessage::ClientsChanged {
            online_client_ids: self.server.connected_client_ids(),
        };
        self.server.broadcast(&roster.encode()).await;
    }

    /// Schedule a persistence write, coalescing while one is in flight.
    fn schedule_save(&mut self) {
        if self.save_in_flight {
            self.save_pending = true;
            return;
        }
        self.spawn_save();
    }

    fn spawn_save(&mut self) {
        self.save_in_flight = true;
        let storage = self.storage.clone();
        let snapshot = self.store.document().clone();
        let done = self.save_tx.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = storage.save(&snapshot) {
                error!("Failed to persist database: {}", e);
            }
            let _ = done.send(());
        });
    }

    fn on_save_done(&mut self) {
        self.save_in_flight = false;
        if self.save_pending {
            self.save_pending = false;
            self.spawn_save();
        }
    }
}
