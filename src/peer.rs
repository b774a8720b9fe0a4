//! One negotiated media link to one remote participant.
//!
//! The coordinator owns a [`PeerConnection`] per remote. Each connection runs
//! a driver task that owns the [`PeerLink`] and applies signals strictly in
//! the order they were queued, so negotiation never blocks the coordinator.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use crate::error::{AppError, Result};
use crate::media::LocalStream;
use crate::signaling::Signal;

const DRIVER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Produces the first signal (we joined after the remote).
    Initiator,
    /// Waits for the remote's first signal.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Negotiating,
    Connected,
    Closed,
}

/// Incoming media from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// Outbound negotiation payload to relay to the remote.
    Signal(Signal),
    RemoteStream(RemoteStream),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub participant: String,
    /// Identifies the connection instance; events from a replaced one are stale.
    pub epoch: u64,
    pub kind: LinkEventKind,
}

/// Lets a link report asynchronous outcomes back to the coordinator.
#[derive(Clone)]
pub struct LinkObserver {
    participant: String,
    epoch: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkObserver {
    pub fn new(participant: String, epoch: u64, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { participant, epoch, events }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        self.emit(LinkEventKind::RemoteStream(stream));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(LinkEventKind::Failed(reason.into()));
    }

    fn signal(&self, signal: Signal) {
        self.emit(LinkEventKind::Signal(signal));
    }

    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            participant: self.participant.clone(),
            epoch: self.epoch,
            kind,
        });
    }
}

pub struct LinkContext {
    pub participant: String,
    pub role: Role,
    /// None when no local stream is available; the link then sends no media.
    pub local_stream: Option<LocalStream>,
    pub observer: LinkObserver,
}

/// Negotiation capability for one remote.
#[async_trait]
pub trait PeerLink: Send {
    /// Initiator only: produces the first outbound payload.
    async fn negotiate(&mut self) -> Result<Signal>;

    /// Consumes one inbound payload, possibly producing a reply.
    async fn apply_signal(&mut self, signal: Signal) -> Result<Option<Signal>>;

    /// Releases everything the link holds. Must be idempotent.
    async fn close(&mut self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, ctx: LinkContext) -> Result<Box<dyn PeerLink>>;
}

enum LinkCommand {
    Apply(Signal),
    Close,
}

pub struct PeerConnection {
    participant: String,
    role: Role,
    state: PeerState,
    epoch: u64,
    remote_stream: Option<RemoteStream>,
    commands: mpsc::UnboundedSender<LinkCommand>,
    driver: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Creates the link and starts its driver. An initiator starts
    /// negotiating right away.
    pub async fn open(
        factory: &dyn PeerLinkFactory,
        participant: &str,
        role: Role,
        epoch: u64,
        local_stream: Option<LocalStream>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let observer = LinkObserver::new(participant.to_string(), epoch, events);
        let link = factory
            .create(LinkContext {
                participant: participant.to_string(),
                role,
                local_stream,
                observer: observer.clone(),
            })
            .await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(link, role, observer, command_rx));
        debug!(participant = %participant, ?role, epoch, "Peer connection opened");

        Ok(Self {
            participant: participant.to_string(),
            role,
            state: PeerState::Negotiating,
            epoch,
            remote_stream: None,
            commands,
            driver: Some(driver),
        })
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Queues an inbound payload behind any earlier ones.
    pub fn apply(&self, signal: Signal) -> Result<()> {
        if self.state == PeerState::Closed {
            return Err(AppError::Protocol(format!(
                "signal for closed connection to {}",
                self.participant
            )));
        }
        self.commands
            .send(LinkCommand::Apply(signal))
            .map_err(|_| AppError::Protocol(format!("driver for {} has stopped", self.participant)))
    }

    /// Records the remote stream. Returns false if the connection was not negotiating.
    pub fn mark_connected(&mut self, stream: RemoteStream) -> bool {
        if self.state != PeerState::Negotiating {
            return false;
        }
        self.state = PeerState::Connected;
        self.remote_stream = Some(stream);
        true
    }

    /// Closes the link and waits for the driver to finish. Idempotent.
    pub async fn close(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        self.state = PeerState::Closed;
        self.remote_stream = None;
        let _ = self.commands.send(LinkCommand::Close);

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DRIVER_CLOSE_TIMEOUT, &mut driver).await.is_err() {
                warn!(participant = %self.participant, "Peer driver did not stop in time, aborting");
                driver.abort();
            }
        }
        debug!(participant = %self.participant, epoch = self.epoch, "Peer connection closed");
    }
}

enum Step<T> {
    Done(T),
    Closed,
}

/// Runs one link operation while still honouring a close request.
async fn step<T>(
    fut: impl Future<Output = T>,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    pending: &mut VecDeque<Signal>,
) -> Step<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return Step::Done(out),
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Apply(signal)) => pending.push_back(signal),
                Some(LinkCommand::Close) | None => return Step::Closed,
            },
        }
    }
}

async fn drive(
    mut link: Box<dyn PeerLink>,
    role: Role,
    observer: LinkObserver,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let mut pending = VecDeque::new();

    if role == Role::Initiator {
        match step(link.negotiate(), &mut commands, &mut pending).await {
            Step::Done(Ok(signal)) => observer.signal(signal),
            Step::Done(Err(e)) => {
                observer.failed(e.to_string());
                link.close().await;
                return;
            }
            Step::Closed => {
                link.close().await;
                return;
            }
        }
    }

    loop {
        let signal = match pending.pop_front() {
            Some(signal) => signal,
            None => match commands.recv().await {
                Some(LinkCommand::Apply(signal)) => signal,
                Some(LinkCommand::Close) | None => break,
            },
        };

        match step(link.apply_signal(signal), &mut commands, &mut pending).await {
            Step::Done(Ok(Some(reply))) => observer.signal(reply),
            Step::Done(Ok(None)) => {}
            Step::Done(Err(e)) => {
                observer.failed(e.to_string());
                break;
            }
            Step::Closed => break,
        }
    }

    link.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        applied: Vec<Signal>,
        closes: usize,
    }

    struct RecordingLink {
        journal: Arc<Mutex<Journal>>,
        observer: LinkObserver,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn negotiate(&mut self) -> Result<Signal> {
            Ok(Signal::new(json!({"type": "offer"})))
        }

        async fn apply_signal(&mut self, signal: Signal) -> Result<Option<Signal>> {
            if signal.0["fail"] == json!(true) {
                return Err(AppError::Protocol("bad payload".into()));
            }
            self.journal.lock().unwrap().applied.push(signal.clone());
            if signal.0["type"] == "answer" {
                self.observer.remote_stream(RemoteStream { stream_id: "s".into(), track_ids: vec![] });
            }
            Ok(None)
        }

        async fn close(&mut self) {
            self.journal.lock().unwrap().closes += 1;
        }
    }

    struct RecordingFactory {
        journal: Arc<Mutex<Journal>>,
    }

    #[async_trait]
    impl PeerLinkFactory for RecordingFactory {
        async fn create(&self, ctx: LinkContext) -> Result<Box<dyn PeerLink>> {
            Ok(Box::new(RecordingLink { journal: self.journal.clone(), observer: ctx.observer }))
        }
    }

    fn factory() -> (RecordingFactory, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        (RecordingFactory { journal: journal.clone() }, journal)
    }

    #[tokio::test]
    async fn initiator_emits_offer_then_connects_on_answer() {
        let (factory, journal) = factory();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut conn = PeerConnection::open(&factory, "b", Role::Initiator, 7, None, events_tx)
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.epoch, 7);
        assert_eq!(first.kind, LinkEventKind::Signal(Signal::new(json!({"type": "offer"}))));

        conn.apply(Signal::new(json!({"type": "answer"}))).unwrap();
        let second = events.recv().await.unwrap();
        let LinkEventKind::RemoteStream(stream) = second.kind else {
            panic!("expected a remote stream");
        };
        assert!(conn.mark_connected(stream));
        assert_eq!(conn.state(), PeerState::Connected);

        conn.close().await;
        conn.close().await;
        assert_eq!(journal.lock().unwrap().closes, 1);
        assert!(conn.remote_stream().is_none());
    }

    #[tokio::test]
    async fn signals_apply_in_arrival_order() {
        let (factory, journal) = factory();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut conn = PeerConnection::open(&factory, "b", Role::Responder, 1, None, events_tx)
            .await
            .unwrap();

        for n in 0..20 {
            conn.apply(Signal::new(json!({"n": n}))).unwrap();
        }
        conn.close().await;

        let applied: Vec<_> = journal.lock().unwrap().applied.iter().map(|s| s.0["n"].clone()).collect();
        assert_eq!(applied.len(), 20);
        for (i, n) in applied.iter().enumerate() {
            assert_eq!(*n, json!(i));
        }
    }

    #[tokio::test]
    async fn apply_after_close_is_rejected() {
        let (factory, _journal) = factory();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut conn = PeerConnection::open(&factory, "b", Role::Responder, 1, None, events_tx)
            .await
            .unwrap();
        conn.close().await;
        assert!(matches!(conn.apply(Signal::new(json!({}))), Err(AppError::Protocol(_))));
        assert!(!conn.mark_connected(RemoteStream { stream_id: "s".into(), track_ids: vec![] }));
    }

    #[tokio::test]
    async fn failing_link_reports_and_closes_itself() {
        let (factory, journal) = factory();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut conn = PeerConnection::open(&factory, "b", Role::Responder, 3, None, events_tx)
            .await
            .unwrap();
        conn.apply(Signal::new(json!({"fail": true}))).unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event.kind, LinkEventKind::Failed(_)));
        conn.close().await;
        assert_eq!(journal.lock().unwrap().closes, 1);
    }
}
