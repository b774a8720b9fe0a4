#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::json;
use mesh_room::media::{CaptureBackend, CaptureTrack, DeviceInfo, MediaKind};
use mesh_room::peer::{LinkContext, LinkObserver, PeerLink, PeerLinkFactory, RemoteStream};
use mesh_room::{MeshHandle, MeshSnapshot, Result, Signal};

pub const WAIT: Duration = Duration::from_secs(5);

struct CountingTrack {
    stops: Arc<AtomicUsize>,
}

impl CaptureTrack for CountingTrack {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture backend with `devices` cameras that counts every stop.
pub struct FakeCapture {
    devices: usize,
    pub stops: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn new(devices: usize) -> Self {
        Self { devices, stops: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn stopped(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok((0..self.devices)
            .map(|i| DeviceInfo {
                id: format!("cam{i}"),
                label: format!("Camera {i}"),
                kind: MediaKind::Video,
            })
            .collect())
    }

    async fn open(&self, _device: &DeviceInfo) -> Result<Arc<dyn CaptureTrack>> {
        Ok(Arc::new(CountingTrack { stops: self.stops.clone() }))
    }
}

/// Answers offers and reports a remote stream once negotiation completes on
/// its side.
struct LoopbackLink {
    observer: LinkObserver,
}

impl LoopbackLink {
    fn connected(&self) {
        self.observer.remote_stream(RemoteStream {
            stream_id: format!("stream-of-{}", self.observer.participant()),
            track_ids: vec![format!("track-of-{}", self.observer.participant())],
        });
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn negotiate(&mut self) -> Result<Signal> {
        Ok(Signal::new(json!({"type": "offer", "sdp": "loopback"})))
    }

    async fn apply_signal(&mut self, signal: Signal) -> Result<Option<Signal>> {
        self.connected();
        if signal.0["type"] == "offer" {
            return Ok(Some(Signal::new(json!({"type": "answer", "sdp": "loopback"}))));
        }
        Ok(None)
    }

    async fn close(&mut self) {}
}

pub struct LoopbackFactory;

#[async_trait]
impl PeerLinkFactory for LoopbackFactory {
    async fn create(&self, ctx: LinkContext) -> Result<Box<dyn PeerLink>> {
        Ok(Box::new(LoopbackLink { observer: ctx.observer }))
    }
}

/// Waits until the session snapshot satisfies `pred`.
pub async fn wait_for(
    handle: &MeshHandle,
    what: &str,
    pred: impl FnMut(&MeshSnapshot) -> bool,
) -> MeshSnapshot {
    let mut rx = handle.subscribe();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("session monitor dropped")
        .clone();
    snapshot
}

pub fn participant(snapshot: &MeshSnapshot) -> String {
    snapshot.participant_id.clone().expect("participant id assigned")
}
