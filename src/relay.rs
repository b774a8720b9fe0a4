//! WebSocket front end of the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use crate::config::{Heartbeat, RelayConfig};
use crate::error::{AppError, Result};
use crate::room::{Outbox, RelayRegistry};
use crate::signaling::SignalingMessage;

/// The membership a connection holds. `generation` tells it apart from a
/// later connection that resumed the same participant.
struct Seat {
    participant_id: String,
    generation: u64,
}

/// Relay-side state of one client connection.
pub struct RelaySession {
    registry: Arc<RelayRegistry>,
    outbox: Outbox,
    seat: Option<Seat>,
}

impl RelaySession {
    pub fn new(registry: Arc<RelayRegistry>, outbox: Outbox) -> Self {
        Self {
            registry,
            outbox,
            seat: None,
        }
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.seat.as_ref().map(|seat| seat.participant_id.as_str())
    }

    /// Applies one client frame. Errors are per-message; the session stays usable.
    pub async fn handle(&mut self, msg: SignalingMessage) -> Result<()> {
        if !msg.is_client_originated() {
            return Err(AppError::Protocol(format!(
                "{} is not accepted from clients",
                msg.event()
            )));
        }
        match msg {
            SignalingMessage::JoinRoom { room, session_token } => {
                if let Some(pid) = self.participant_id() {
                    return Err(AppError::Protocol(format!("{} already joined a room", pid)));
                }
                if room.trim().is_empty() {
                    return Err(AppError::Protocol("join-room without a room".into()));
                }
                match self
                    .registry
                    .join(&room, session_token.as_deref(), self.outbox.clone())
                    .await
                {
                    Ok(outcome) => {
                        self.seat = Some(Seat {
                            participant_id: outcome.participant_id,
                            generation: outcome.generation,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        let _ = self.outbox.send(SignalingMessage::Error { message: e.to_string() });
                        Err(e)
                    }
                }
            }
            SignalingMessage::LeaveRoom => {
                if let Some(seat) = self.seat.take() {
                    self.registry.leave(&seat.participant_id, seat.generation).await;
                }
                Ok(())
            }
            msg => {
                let pid = self
                    .participant_id()
                    .ok_or_else(|| AppError::Protocol(format!("{} before join-room", msg.event())))?;
                self.registry.forward(pid, msg).await.map(|_| ())
            }
        }
    }

    /// The channel is gone. The participant keeps its identity for `grace`
    /// so a reconnect can resume it, then it is evicted.
    ///
    /// Nothing happens when another connection has resumed the participant
    /// in the meantime.
    pub async fn disconnect(mut self, grace: Duration) {
        let Some(Seat { participant_id: pid, generation }) = self.seat.take() else {
            return;
        };
        if grace.is_zero() {
            self.registry.leave(&pid, generation).await;
            return;
        }
        if self.registry.detach(&pid, generation).await {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if registry.evict_if_detached(&pid, generation).await {
                    info!(participant = %pid, "Evicted after disconnect");
                }
            });
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<RelayRegistry>,
    config: RelayConfig,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(RelayRegistry::new(config.max_participants)),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<RelayRegistry> {
        self.registry.clone()
    }

    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Relay listening");
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let registry = self.registry.clone();
            let grace = self.config.disconnect_grace;
            let heartbeat = self.config.heartbeat;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, registry, grace, heartbeat).await {
                    warn!(%peer_addr, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<RelayRegistry>,
    grace: Duration,
    heartbeat: Heartbeat,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    debug!(%peer_addr, "WebSocket accepted");
    serve_socket(ws_stream, peer_addr.to_string(), registry, grace, heartbeat).await;
    Ok(())
}

/// Runs one accepted WebSocket until the client leaves, the socket fails,
/// or the client stays silent for longer than the idle timeout.
async fn serve_socket<S>(
    ws_stream: WebSocketStream<S>,
    peer: String,
    registry: Arc<RelayRegistry>,
    grace: Duration,
    heartbeat: Heartbeat,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws_stream.split();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<SignalingMessage>();

    // Handle outgoing messages and keep-alive pings
    tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = outgoing.recv() => match msg {
                    Some(msg) => match msg.to_frame() {
                        Ok(json) => {
                            if write.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode frame"),
                    },
                    None => break,
                },
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = write.close().await;
    });

    let mut session = RelaySession::new(registry, outbox);
    let idle = tokio::time::sleep(heartbeat.idle_timeout);
    tokio::pin!(idle);
    loop {
        let frame = tokio::select! {
            frame = read.next() => frame,
            _ = &mut idle => {
                warn!(%peer, timeout = ?heartbeat.idle_timeout, "Client went silent");
                break;
            }
        };
        let Some(frame) = frame else {
            break;
        };
        // Any frame, pongs included, proves the client is still there.
        idle.as_mut().reset(Instant::now() + heartbeat.idle_timeout);
        match frame {
            Ok(Message::Text(text)) => match SignalingMessage::from_frame(&text) {
                Ok(msg) => {
                    let event = msg.event();
                    if let Err(e) = session.handle(msg).await {
                        warn!(%peer, event, error = %e, "Dropped message");
                        if !e.is_recoverable() {
                            break;
                        }
                    }
                }
                Err(e) => warn!(%peer, error = %e, "Dropped frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    debug!(%peer, participant = ?session.participant_id(), "Connection closed");
    session.disconnect(grace).await;
}
