//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── presence channels (doc:<id>)
//!            ├── RelayServer ── RelayHub
//! Client B ──┘    (one task         └── rooms ── Yrs Doc + awareness table
//!                  per socket)
//! ```
//!
//! Each socket becomes one hub peer. Frames read from the socket go to
//! [`RelayHub::handle_client_frame`]; frames queued on the peer's outbox are
//! written back. A heartbeat ping goes out every
//! [`RelayConfig::heartbeat_interval`]; a peer that sends nothing (not even
//! the answering pong) for two intervals is disconnected.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RelayHub;
use crate::config::RelayConfig;
use crate::protocol::RelayFrame;

/// Heartbeat intervals a peer may stay silent before it is dropped.
const MISSED_HEARTBEATS: u32 = 2;

/// Relay server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub channels: usize,
    pub rooms: usize,
    pub frames_sent: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<RelayHub>,
    listener: TcpListener,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let hub = Arc::new(RelayHub::with_room_limit(config.max_peers_per_room));
        Ok(Self { config, hub, listener })
    }

    /// Address actually bound (resolves port `0`).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub async fn stats(&self) -> ServerStats {
        let hub = self.hub.stats().await;
        ServerStats {
            channels: hub.channels,
            rooms: hub.rooms,
            frames_sent: hub.frames_sent,
        }
    }

    /// Accept connections until the listener fails.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay server listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve one WebSocket connection as one hub peer.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RelayHub>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let peer = Uuid::new_v4();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<RelayFrame>();
        log::info!("Peer {peer} connected from {addr}");

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        // The first tick completes immediately.
        heartbeat.tick().await;
        let silence_limit = config.heartbeat_interval * MISSED_HEARTBEATS;
        let mut last_seen = Instant::now();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    if matches!(msg, Some(Ok(_))) {
                        last_seen = Instant::now();
                    }
                    match msg {
                        Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                            Ok(RelayFrame::Pong) => log::trace!("Peer {peer}: pong"),
                            Ok(frame) => hub.handle_client_frame(peer, &outbox, frame).await,
                            Err(e) => log::warn!("Peer {peer}: undecodable frame: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                    }
                }

                Some(frame) = outbox_rx.recv() => {
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Peer {peer}: dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                        break Err(e.into());
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > silence_limit {
                        log::warn!("Peer {peer}: no traffic for {silence_limit:?}, dropping");
                        break Ok(());
                    }
                    // Receiver lives in this loop, so the send cannot fail.
                    let _ = outbox.send(RelayFrame::Ping);
                }
            }
        };

        hub.disconnect_peer(&peer).await;
        log::info!("Peer {peer} disconnected");
        result
    }
}
