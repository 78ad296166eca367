//! WebSocket server for accepting client connections.
//!
//! Manages connection lifecycle, client id assignment, and frame routing.
//! Clients are identified by server-assigned connection ids (`client-1`,
//! `client-2`, …) for the lifetime of their socket.

use crate::connection::{ClientConnection, ConnectionEvent, IncomingFrame};
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Event emitted by the server.
#[derive(Debug)]
pub enum ServerEvent {
    /// A frame from a connected client.
    Frame(IncomingFrame),
    /// A client disconnected.
    ClientDisconnected { client_id: String },
}

/// WebSocket server managing client connections.
pub struct WsServer {
    /// Connected clients indexed by client id
    clients: HashMap<String, ClientConnection>,
    /// Counter for generating client ids
    next_client_id: u64,
    /// Channel sender for connection events (frames, closes)
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Channel receiver for connection events
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl WsServer {
    /// Create a new WebSocket server.
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection.
    ///
    /// Upgrades to WebSocket, assigns a client id, and starts the read task.
    /// Returns the new client id, or `None` when the upgrade failed.
    pub async fn accept_connection(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<String> {
        // Upgrade to WebSocket
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return None;
            }
        };

        let client_id = format!("client-{}", self.next_client_id);
        self.next_client_id += 1;

        // Loopback connections come from the machine hosting the daemon.
        let is_host = addr.ip().is_loopback();

        info!("New connection from {} (client_id: {})", addr, client_id);

        let conn = ClientConnection::new(
            client_id.clone(),
            is_host,
            ws_stream,
            self.event_tx.clone(),
        );
        self.clients.insert(client_id.clone(), conn);

        Some(client_id)
    }

    /// Wait for the next server event.
    ///
    /// Closes for clients the server already removed are swallowed so
    /// callers only ever see one disconnect per client.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = self.event_rx.recv().await?;

            match event {
                ConnectionEvent::Frame(frame) => {
                    return Some(ServerEvent::Frame(frame));
                }
                ConnectionEvent::Closed { client_id } => {
                    if self.clients.remove(&client_id).is_some() {
                        return Some(ServerEvent::ClientDisconnected { client_id });
                    }
                    debug!("Close for already-removed client {}", client_id);
                    continue;
                }
            }
        }
    }

    /// Send a text frame to a specific client.
    pub async fn send(&self, client_id: &str, text: &str) -> Result<()> {
        let conn = self
            .clients
            .get(client_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown client: {}", client_id))?;

        conn.send(text).await
    }

    /// Broadcast a text frame to all connected clients.
    pub async fn broadcast(&self, text: &str) {
        for (client_id, conn) in &self.clients {
            if let Err(e) = conn.send(text).await {
                warn!("Failed to broadcast to {}: {}", client_id, e);
            }
        }
    }

    /// Whether the given client connected over loopback.
    pub fn is_host(&self, client_id: &str) -> bool {
        self.clients
            .get(client_id)
            .map(|c| c.is_host)
            .unwrap_or(false)
    }

    /// Get the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Get connected client ids, ordered by connection number.
    pub fn connected_client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort_by_key(|id| client_number(id));
        ids
    }
}

impl Default for WsServer {
    fn default() -> Self {
        Self::new()
    }
}

fn client_number(client_id: &str) -> u64 {
    client_id
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
