//! Client-side mesh coordination.
//!
//! The coordinator keeps one [`PeerConnection`] per other member of the room.
//! It reacts to relay events, forwards link signals back through the relay
//! and publishes what it has to a [`SessionMonitor`].

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::channel::{ChannelEvent, ChannelLink, SignalChannel};
use crate::config::ClientConfig;
use crate::connection::{MeshSnapshot, RemotePeer, SessionMonitor, SessionStatus};
use crate::error::{AppError, Result};
use crate::media::{CaptureBackend, MediaSourceSet};
use crate::peer::{LinkEvent, LinkEventKind, PeerConnection, PeerLinkFactory, PeerState, Role};
use crate::signaling::{Signal, SignalingMessage};

/// A fresh room id, for starting a new room.
pub fn new_room_id() -> String {
    Uuid::new_v4().to_string()
}

/// Who we are in which room. Survives reconnects; the relay fills in the
/// participant id and token on welcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub room_id: String,
    pub participant_id: Option<String>,
    pub session_token: Option<String>,
}

impl SessionContext {
    pub fn new(room_id: impl Into<String>, session_token: Option<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_id: None,
            session_token,
        }
    }
}

enum MeshCommand {
    Leave(oneshot::Sender<()>),
}

pub struct MeshCoordinator {
    session: SessionContext,
    factory: Arc<dyn PeerLinkFactory>,
    media: MediaSourceSet,
    outbound_stream: usize,
    peers: HashMap<String, PeerConnection>,
    /// Remote ids in the order their connections were created.
    order: Vec<String>,
    /// Removed remotes whose late signals are ignored until announced again.
    departed: HashSet<String>,
    next_epoch: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    channel: ChannelLink,
    monitor: SessionMonitor,
    joined_once: bool,
    /// A join-room is out and its welcome has not arrived yet.
    awaiting_welcome: bool,
}

impl MeshCoordinator {
    pub fn new(
        session: SessionContext,
        media: MediaSourceSet,
        outbound_stream: usize,
        factory: Arc<dyn PeerLinkFactory>,
        channel: ChannelLink,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let monitor = SessionMonitor::new(&session.room_id);
        monitor.set_local_streams(media.infos());
        if media.get(outbound_stream).is_none() {
            info!(outbound_stream, available = media.len(), "No outbound stream, peers will receive only");
        }
        Self {
            session,
            factory,
            media,
            outbound_stream,
            peers: HashMap::new(),
            order: Vec::new(),
            departed: HashSet::new(),
            next_epoch: 0,
            link_tx,
            link_rx,
            channel,
            monitor,
            joined_once: false,
            awaiting_welcome: false,
        }
    }

    /// Starts the coordinator on its own task.
    pub fn spawn(self) -> MeshHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let room_id = self.session.room_id.clone();
        let monitor = self.monitor.clone();
        let task = tokio::spawn(self.run(command_rx));
        MeshHandle {
            room_id,
            monitor,
            commands,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MeshCommand>) {
        info!(room = %self.session.room_id, "Mesh coordinator started");
        loop {
            let flow = tokio::select! {
                event = self.channel.events.recv() => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => {
                        self.shut_down(SessionStatus::Disconnected, Some("signaling channel closed".into())).await;
                        ControlFlow::Break(())
                    }
                },
                Some(event) = self.link_rx.recv() => {
                    self.on_link_event(event).await;
                    ControlFlow::Continue(())
                },
                command = commands.recv() => {
                    self.leave().await;
                    if let Some(MeshCommand::Leave(done)) = command {
                        let _ = done.send(());
                    }
                    ControlFlow::Break(())
                },
            };
            if flow.is_break() {
                break;
            }
        }
        info!(room = %self.session.room_id, participant = ?self.session.participant_id, "Mesh coordinator stopped");
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) -> ControlFlow<()> {
        match event {
            ChannelEvent::Connected => {
                if self.joined_once {
                    // The relay resumes our identity but every remote rebuilds
                    // its side, so ours are stale.
                    info!(room = %self.session.room_id, "Signaling restored, rejoining");
                    self.close_all_peers().await;
                    self.publish_remotes();
                }
                self.joined_once = true;
                self.awaiting_welcome = true;
                self.monitor.update_status(SessionStatus::Connecting);
                self.send(SignalingMessage::JoinRoom {
                    room: self.session.room_id.clone(),
                    session_token: self.session.session_token.clone(),
                });
            }
            ChannelEvent::Message(msg) => return self.on_message(msg).await,
            ChannelEvent::Reconnecting { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to signaling server");
                self.monitor.update_status(SessionStatus::Reconnecting { attempt });
            }
            ChannelEvent::Lost(reason) => {
                warn!(room = %self.session.room_id, %reason, "Signaling channel lost");
                self.shut_down(SessionStatus::Disconnected, Some(reason)).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_message(&mut self, msg: SignalingMessage) -> ControlFlow<()> {
        match msg {
            SignalingMessage::Welcome { participant_id, session_token, resumed } => {
                info!(room = %self.session.room_id, participant = %participant_id, resumed, "Joined room");
                self.awaiting_welcome = false;
                self.monitor.set_participant(&participant_id);
                self.monitor.update_status(SessionStatus::Joined);
                self.session.participant_id = Some(participant_id);
                self.session.session_token = Some(session_token);
            }
            SignalingMessage::AllUsers { participant_ids } => {
                debug!(count = participant_ids.len(), "Received roster");
                for remote in participant_ids {
                    if Some(&remote) == self.session.participant_id.as_ref() {
                        continue;
                    }
                    self.departed.remove(&remote);
                    self.replace_peer(&remote, Role::Initiator).await;
                }
            }
            SignalingMessage::UserJoined { caller_id, signal: None } => {
                debug!(participant = %caller_id, "Participant joined");
                self.departed.remove(&caller_id);
                self.replace_peer(&caller_id, Role::Responder).await;
            }
            SignalingMessage::UserJoined { caller_id, signal: Some(signal) } => {
                if self.departed.contains(&caller_id) {
                    debug!(participant = %caller_id, "Ignoring signal from departed participant");
                    return ControlFlow::Continue(());
                }
                if !self.peers.contains_key(&caller_id) {
                    self.replace_peer(&caller_id, Role::Responder).await;
                }
                self.apply_signal(&caller_id, signal);
            }
            SignalingMessage::ReceivingReturnedSignal { id, signal } => {
                match self.peers.get(&id) {
                    Some(conn) if conn.role() == Role::Initiator => self.apply_signal(&id, signal),
                    _ => {
                        let e = AppError::Protocol(format!("returned signal from {} without a pending offer", id));
                        warn!(participant = %id, error = %e, "Ignoring returned signal");
                    }
                }
            }
            SignalingMessage::UserLeft { id } => {
                info!(participant = %id, "Participant left");
                self.remove_peer(&id).await;
                self.departed.insert(id);
                self.publish_remotes();
            }
            SignalingMessage::Error { message } if self.awaiting_welcome => {
                warn!(room = %self.session.room_id, %message, "Relay refused the join");
                self.shut_down(SessionStatus::Rejected, Some(message)).await;
                return ControlFlow::Break(());
            }
            SignalingMessage::Error { message } => {
                warn!(room = %self.session.room_id, %message, "Relay reported an error");
                self.monitor.set_error(message);
            }
            other => {
                warn!(event = other.event(), "Unexpected message from relay");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        let Some(conn) = self.peers.get_mut(&event.participant) else {
            debug!(participant = %event.participant, "Event for a removed connection");
            return;
        };
        if conn.epoch() != event.epoch {
            debug!(participant = %event.participant, epoch = event.epoch, "Event from a replaced connection");
            return;
        }

        match event.kind {
            LinkEventKind::Signal(signal) => {
                let Some(me) = self.session.participant_id.clone() else {
                    warn!(participant = %event.participant, "Signal produced before welcome, dropping");
                    return;
                };
                let msg = match conn.role() {
                    Role::Initiator => SignalingMessage::SendingSignal {
                        user_to_signal: event.participant,
                        caller_id: me,
                        signal,
                    },
                    Role::Responder => SignalingMessage::ReturningSignal {
                        signal,
                        caller_id: event.participant,
                    },
                };
                self.send(msg);
            }
            LinkEventKind::RemoteStream(stream) => {
                if conn.mark_connected(stream) {
                    info!(participant = %event.participant, "Peer connected");
                    self.publish_remotes();
                }
            }
            LinkEventKind::Failed(reason) => {
                warn!(participant = %event.participant, %reason, "Peer connection failed");
                self.monitor.set_error(format!("{}: {}", event.participant, reason));
                self.remove_peer(&event.participant).await;
                self.publish_remotes();
            }
        }
    }

    /// Opens a connection to `remote`, closing any existing one first.
    async fn replace_peer(&mut self, remote: &str, role: Role) {
        if self.peers.contains_key(remote) {
            debug!(participant = %remote, "Replacing stale connection");
            self.remove_peer(remote).await;
            self.publish_remotes();
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let local_stream = self.media.get(self.outbound_stream).cloned();
        match PeerConnection::open(
            self.factory.as_ref(),
            remote,
            role,
            epoch,
            local_stream,
            self.link_tx.clone(),
        )
        .await
        {
            Ok(conn) => {
                self.peers.insert(remote.to_string(), conn);
                self.order.push(remote.to_string());
            }
            Err(e) => {
                warn!(participant = %remote, error = %e, "Failed to open peer connection");
                self.monitor.set_error(format!("{}: {}", remote, e));
            }
        }
    }

    fn apply_signal(&mut self, remote: &str, signal: Signal) {
        if let Some(conn) = self.peers.get(remote) {
            if let Err(e) = conn.apply(signal) {
                warn!(participant = %remote, error = %e, "Failed to queue signal");
            }
        }
    }

    async fn remove_peer(&mut self, remote: &str) {
        self.order.retain(|id| id != remote);
        if let Some(mut conn) = self.peers.remove(remote) {
            conn.close().await;
        }
    }

    async fn close_all_peers(&mut self) {
        self.order.clear();
        let mut closing: Vec<PeerConnection> = self.peers.drain().map(|(_, conn)| conn).collect();
        join_all(closing.iter_mut().map(|conn| conn.close())).await;
    }

    fn publish_remotes(&self) {
        let remotes = self
            .order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter(|conn| conn.state() == PeerState::Connected)
            .filter_map(|conn| {
                conn.remote_stream().map(|stream| RemotePeer {
                    participant_id: conn.participant().to_string(),
                    stream: stream.clone(),
                })
            })
            .collect();
        self.monitor.set_remotes(remotes);
    }

    fn send(&self, msg: SignalingMessage) {
        if self.channel.outbound.send(msg).is_err() {
            debug!("Signaling channel already closed");
        }
    }

    async fn leave(&mut self) {
        info!(room = %self.session.room_id, participant = ?self.session.participant_id, "Leaving room");
        self.send(SignalingMessage::LeaveRoom);
        self.shut_down(SessionStatus::Left, None).await;
    }

    async fn shut_down(&mut self, status: SessionStatus, error: Option<String>) {
        self.close_all_peers().await;
        let released = self.media.release();
        debug!(released, "Released local media");
        self.monitor.set_local_streams(Vec::new());
        self.publish_remotes();
        if let Some(error) = error {
            self.monitor.set_error(error);
        }
        self.monitor.update_status(status);
    }
}

/// Owner's handle on a running room session.
pub struct MeshHandle {
    room_id: String,
    monitor: SessionMonitor,
    commands: mpsc::UnboundedSender<MeshCommand>,
    task: JoinHandle<()>,
}

impl MeshHandle {
    /// The room id, for sharing with others who want to join.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.monitor.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.monitor.subscribe()
    }

    /// Leaves the room. Returns once every connection is closed and local
    /// media is released.
    pub async fn leave(self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        if self.commands.send(MeshCommand::Leave(done)).is_ok() {
            let _ = done_rx.await;
        }
        self.task
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!("mesh coordinator failed: {}", e)))
    }

    /// Waits for the session to end on its own. Losing the relay is
    /// reported as a transport error, a refused join as `Rejected`.
    pub async fn closed(self) -> Result<()> {
        let Self { monitor, commands, task, .. } = self;
        let result = task.await;
        drop(commands);
        result.map_err(|e| AppError::Other(anyhow::anyhow!("mesh coordinator failed: {}", e)))?;

        let snapshot = monitor.snapshot();
        match snapshot.status {
            SessionStatus::Disconnected => Err(AppError::Transport(
                snapshot.last_error.unwrap_or_else(|| "signaling channel lost".into()),
            )),
            SessionStatus::Rejected => Err(AppError::Rejected(
                snapshot.last_error.unwrap_or_else(|| "join refused".into()),
            )),
            _ => Ok(()),
        }
    }

    /// Stops the session without notifying the relay. Local media is still
    /// released when the coordinator is dropped.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Joins the configured room: opens the signaling channel, acquires local
/// media and starts the coordinator.
pub async fn join_room(
    config: &ClientConfig,
    backend: &dyn CaptureBackend,
    factory: Arc<dyn PeerLinkFactory>,
) -> Result<MeshHandle> {
    config.validate()?;
    let room_id = config.room_id.clone().unwrap_or_else(new_room_id);
    let (channel, _channel_task) = SignalChannel::spawn(
        config.signaling_url.clone(),
        config.reconnect.clone(),
        config.heartbeat,
    );
    let media = MediaSourceSet::acquire(backend, config.max_streams).await;
    info!(room = %room_id, streams = media.len(), "Joining room");
    Ok(MeshCoordinator::new(
        SessionContext::new(room_id, config.session_token.clone()),
        media,
        config.outbound_stream,
        factory,
        channel,
    )
    .spawn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{LinkContext, PeerLink};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Link that connects as soon as it sees an answer, and answers offers.
    struct EchoLink {
        ctx_observer: crate::peer::LinkObserver,
    }

    #[async_trait]
    impl PeerLink for EchoLink {
        async fn negotiate(&mut self) -> Result<Signal> {
            Ok(Signal::new(json!({"type": "offer"})))
        }

        async fn apply_signal(&mut self, signal: Signal) -> Result<Option<Signal>> {
            let stream = crate::peer::RemoteStream {
                stream_id: format!("{}-stream", self.ctx_observer.participant()),
                track_ids: vec![],
            };
            if signal.0["type"] == "offer" {
                self.ctx_observer.remote_stream(stream);
                return Ok(Some(Signal::new(json!({"type": "answer"}))));
            }
            self.ctx_observer.remote_stream(stream);
            Ok(None)
        }

        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct EchoFactory {
        created: Mutex<Vec<(String, Role, bool)>>,
    }

    #[async_trait]
    impl PeerLinkFactory for EchoFactory {
        async fn create(&self, ctx: LinkContext) -> Result<Box<dyn PeerLink>> {
            self.created
                .lock()
                .unwrap()
                .push((ctx.participant.clone(), ctx.role, ctx.local_stream.is_some()));
            Ok(Box::new(EchoLink { ctx_observer: ctx.observer }))
        }
    }

    struct Fixture {
        coordinator: MeshCoordinator,
        factory: Arc<EchoFactory>,
        sent: mpsc::UnboundedReceiver<SignalingMessage>,
        _events: mpsc::UnboundedSender<ChannelEvent>,
    }

    fn fixture() -> Fixture {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let factory = Arc::new(EchoFactory::default());
        let coordinator = MeshCoordinator::new(
            SessionContext::new("abc", None),
            MediaSourceSet::empty(),
            0,
            factory.clone(),
            ChannelLink { outbound, events },
        );
        Fixture { coordinator, factory, sent, _events: events_tx }
    }

    async fn welcome(f: &mut Fixture, id: &str) {
        f.coordinator
            .on_message(SignalingMessage::Welcome {
                participant_id: id.into(),
                session_token: format!("{}-token", id),
                resumed: false,
            })
            .await;
    }

    async fn pump_link_events(f: &mut Fixture, count: usize) {
        for _ in 0..count {
            let event = f.coordinator.link_rx.recv().await.unwrap();
            f.coordinator.on_link_event(event).await;
        }
    }

    #[tokio::test]
    async fn connected_sends_join_with_token() {
        let mut f = fixture();
        f.coordinator.session.session_token = Some("tok".into());
        let _ = f.coordinator.on_channel_event(ChannelEvent::Connected).await;
        assert_eq!(
            f.sent.try_recv().unwrap(),
            SignalingMessage::JoinRoom { room: "abc".into(), session_token: Some("tok".into()) }
        );
    }

    #[tokio::test]
    async fn roster_creates_initiators_without_local_media() {
        let mut f = fixture();
        welcome(&mut f, "c").await;
        f.coordinator
            .on_message(SignalingMessage::AllUsers { participant_ids: vec!["a".into(), "b".into(), "c".into()] })
            .await;

        let created = f.factory.created.lock().unwrap().clone();
        assert_eq!(
            created,
            vec![("a".to_string(), Role::Initiator, false), ("b".to_string(), Role::Initiator, false)]
        );
        assert_eq!(f.coordinator.order, vec!["a".to_string(), "b".to_string()]);

        pump_link_events(&mut f, 2).await;
        let mut targets = Vec::new();
        while let Ok(SignalingMessage::SendingSignal { user_to_signal, caller_id, .. }) = f.sent.try_recv() {
            assert_eq!(caller_id, "c");
            targets.push(user_to_signal);
        }
        targets.sort();
        assert_eq!(targets, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn responder_returns_answer_and_publishes_stream() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined {
                caller_id: "b".into(),
                signal: Some(Signal::new(json!({"type": "offer"}))),
            })
            .await;

        // Remote stream then the answer.
        pump_link_events(&mut f, 2).await;
        assert_eq!(
            f.sent.try_recv().unwrap(),
            SignalingMessage::ReturningSignal { signal: Signal::new(json!({"type": "answer"})), caller_id: "b".into() }
        );
        assert_eq!(f.coordinator.monitor.snapshot().remote_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn returned_signal_without_initiator_is_ignored() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::ReceivingReturnedSignal {
                id: "ghost".into(),
                signal: Signal::new(json!({"type": "answer"})),
            })
            .await;
        assert!(f.coordinator.peers.is_empty());
        assert!(f.factory.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn departed_participant_signals_are_ignored() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        f.coordinator.on_message(SignalingMessage::UserLeft { id: "b".into() }).await;
        assert!(f.coordinator.peers.is_empty());

        f.coordinator
            .on_message(SignalingMessage::UserJoined {
                caller_id: "b".into(),
                signal: Some(Signal::new(json!({"type": "offer"}))),
            })
            .await;
        assert!(f.coordinator.peers.is_empty());
        assert_eq!(f.factory.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejoin_announcement_replaces_stale_connection() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        let first_epoch = f.coordinator.peers["b"].epoch();
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        assert_eq!(f.coordinator.peers.len(), 1);
        assert_ne!(f.coordinator.peers["b"].epoch(), first_epoch);
        assert_eq!(f.coordinator.order, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn stale_epoch_events_are_dropped() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        let stale = LinkEvent {
            participant: "b".into(),
            epoch: 99,
            kind: LinkEventKind::RemoteStream(crate::peer::RemoteStream { stream_id: "s".into(), track_ids: vec![] }),
        };
        f.coordinator.on_link_event(stale).await;
        assert_eq!(f.coordinator.peers["b"].state(), PeerState::Negotiating);
        assert!(f.coordinator.monitor.snapshot().remotes.is_empty());
    }

    #[tokio::test]
    async fn lost_channel_disconnects() {
        let mut f = fixture();
        welcome(&mut f, "a").await;
        f.coordinator
            .on_message(SignalingMessage::UserJoined { caller_id: "b".into(), signal: None })
            .await;
        let flow = f.coordinator.on_channel_event(ChannelEvent::Lost("gone".into())).await;
        assert!(flow.is_break());
        let snapshot = f.coordinator.monitor.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Disconnected);
        assert_eq!(snapshot.last_error.as_deref(), Some("gone"));
        assert!(f.coordinator.peers.is_empty());
        assert!(f.coordinator.media.is_released());
    }

    #[tokio::test]
    async fn error_before_welcome_ends_the_session() {
        let mut f = fixture();
        let _ = f.coordinator.on_channel_event(ChannelEvent::Connected).await;
        assert!(matches!(f.sent.try_recv().unwrap(), SignalingMessage::JoinRoom { .. }));

        let flow = f
            .coordinator
            .on_channel_event(ChannelEvent::Message(SignalingMessage::Error { message: "Room abc is full".into() }))
            .await;
        assert!(flow.is_break());
        let snapshot = f.coordinator.monitor.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Rejected);
        assert_eq!(snapshot.last_error.as_deref(), Some("Room abc is full"));
        assert!(f.coordinator.media.is_released());
    }

    #[tokio::test]
    async fn error_after_welcome_is_recorded_only() {
        let mut f = fixture();
        let _ = f.coordinator.on_channel_event(ChannelEvent::Connected).await;
        welcome(&mut f, "a").await;
        let flow = f
            .coordinator
            .on_message(SignalingMessage::Error { message: "bad frame".into() })
            .await;
        assert!(flow.is_continue());
        let snapshot = f.coordinator.monitor.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Joined);
        assert_eq!(snapshot.last_error.as_deref(), Some("bad frame"));
    }

    #[test]
    fn room_ids_are_unique() {
        assert_ne!(new_room_id(), new_room_id());
    }
}
