//! WebSocket presence server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── outbox A ──▶ Client A
//!             ├── PresenceHub ───────┤
//! Client B ──┘   (registries)        └── outbox B ──▶ Client B
//!                     ▲
//!                     └── sweeper: evicts connections past the liveness timeout
//! ```
//!
//! Each connection task owns its socket and a bounded outbox. The hub only
//! ever `try_send`s into outboxes; evicting a connection drops its outbox,
//! which ends the task.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::router::PresenceHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before fan-out starts dropping
    pub outbox_capacity: usize,
    /// Silence after which a connection is evicted
    pub liveness_timeout: Duration,
    /// How often the sweeper looks for stale connections
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            outbox_capacity: 256,
            liveness_timeout: Duration::from_secs(65),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// The presence server.
pub struct PresenceServer {
    config: ServerConfig,
    hub: Arc<PresenceHub>,
}

impl PresenceServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hub: Arc::new(PresenceHub::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Shared handle to the hub, for stats and roster queries.
    pub fn hub(&self) -> Arc<PresenceHub> {
        Arc::clone(&self.hub)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Presence server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sweeper = tokio::spawn(Self::sweep(
            Arc::clone(&self.hub),
            self.config.liveness_timeout,
            self.config.sweep_interval,
        ));

        let result = self.accept_loop(&listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = Arc::clone(&self.hub);
            let outbox_capacity = self.config.outbox_capacity;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, outbox_capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn sweep(hub: Arc<PresenceHub>, liveness_timeout: Duration, sweep_interval: Duration) {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for departed in hub.sweep_stale(liveness_timeout).await {
                log::info!(
                    "Evicted {} ({}) after {:?} of silence",
                    departed.connection_id,
                    departed.user_name.as_deref().unwrap_or("anonymous"),
                    liveness_timeout
                );
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<PresenceHub>,
        outbox_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbox, mut inbox) = mpsc::channel::<Arc<str>>(outbox_capacity);
        let connection_id = hub.open(outbox).await;
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.handle_frame(connection_id, text.as_str()).await;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            hub.touch(connection_id).await;
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {connection_id}");
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection_id} closed by {addr}");
                            break Ok(());
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing frame queued by the hub
                frame = inbox.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                                break Err(e.into());
                            }
                        }
                        None => {
                            log::info!("Connection {connection_id} evicted");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }
            }
        };

        hub.close(connection_id).await;
        result
    }
}
