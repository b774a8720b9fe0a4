//! Client side of the signaling transport.
//!
//! A [`SignalChannel`] keeps one WebSocket to the relay alive in a background
//! task. Drops are retried with capped exponential backoff; the owner only
//! sees [`ChannelEvent`]s and never touches the socket.

use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use crate::config::{Heartbeat, ReconnectPolicy};
use crate::signaling::SignalingMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A link to the relay is up. Sent again after every successful reconnect.
    Connected,
    Message(SignalingMessage),
    Reconnecting { attempt: u32, delay: Duration },
    /// The retry budget is exhausted. No further events follow.
    Lost(String),
}

/// The owner's ends of a signaling channel.
///
/// Dropping `outbound` shuts the channel down after queued messages are sent.
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<SignalingMessage>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub struct SignalChannel;

impl SignalChannel {
    pub fn spawn(url: String, policy: ReconnectPolicy, heartbeat: Heartbeat) -> (ChannelLink, JoinHandle<()>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url, policy, heartbeat, outbound_rx, events_tx));
        (ChannelLink { outbound, events }, task)
    }
}

enum LinkEnd {
    /// The owner is gone; stop for good.
    Finished,
    Dropped(String),
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    heartbeat: Heartbeat,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut attempt = 0u32;
    loop {
        let reason = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(%url, "Connected to signaling server");
                attempt = 0;

                // Anything queued while the previous link was down targeted a
                // session the relay no longer has.
                let mut stale = 0usize;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "Discarded messages queued on the dead link");
                }

                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }
                match pump(ws_stream, &mut outbound, &events, heartbeat).await {
                    LinkEnd::Finished => return,
                    LinkEnd::Dropped(reason) => {
                        warn!(%url, %reason, "Signaling link dropped");
                        reason
                    }
                }
            }
            Err(e) => {
                warn!(%url, attempt, error = %e, "Failed to connect to signaling server");
                e.to_string()
            }
        };

        attempt += 1;
        if attempt > policy.max_attempts {
            warn!(%url, attempts = policy.max_attempts, "Giving up on signaling server");
            let _ = events.send(ChannelEvent::Lost(format!(
                "relay unreachable after {} attempts: {}",
                policy.max_attempts, reason
            )));
            return;
        }

        let delay = policy.delay_for(attempt);
        if events.send(ChannelEvent::Reconnecting { attempt, delay }).is_err() {
            return;
        }
        if !backoff(delay, &mut outbound).await {
            return;
        }
    }
}

/// Waits out `delay`. Returns false if the owner went away meanwhile.
async fn backoff(delay: Duration, outbound: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            msg = outbound.recv() => match msg {
                Some(msg) => debug!(event = msg.event(), "Dropped message while disconnected"),
                None => return false,
            },
        }
    }
}

/// Moves frames between one live socket and the owner. Pings the relay
/// every `heartbeat.interval` and gives the link up once nothing has arrived
/// for `heartbeat.idle_timeout`.
async fn pump<S>(
    ws_stream: WebSocketStream<S>,
    outbound: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    heartbeat: Heartbeat,
) -> LinkEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(heartbeat.idle_timeout);
    tokio::pin!(idle);
    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return LinkEnd::Dropped(e.to_string());
                }
            }
            _ = &mut idle => {
                return LinkEnd::Dropped(format!("relay silent for {:?}", heartbeat.idle_timeout));
            }
            msg = outbound.recv() => match msg {
                Some(msg) => match msg.to_frame() {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            return LinkEnd::Dropped(e.to_string());
                        }
                    }
                    Err(e) => warn!(event = msg.event(), error = %e, "Failed to encode frame"),
                },
                None => {
                    let _ = write.close().await;
                    return LinkEnd::Finished;
                }
            },
            frame = read.next() => {
                if let Some(Ok(_)) = &frame {
                    idle.as_mut().reset(Instant::now() + heartbeat.idle_timeout);
                }
                match frame {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_frame(&text) {
                        Ok(msg) => {
                            if events.send(ChannelEvent::Message(msg)).is_err() {
                                let _ = write.close().await;
                                return LinkEnd::Finished;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropped frame from relay"),
                    },
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Dropped("closed by relay".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                }
            }
        }
    }
}
