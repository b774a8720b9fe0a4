//! Local capture streams bound to a room session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use crate::error::Result;

/// Devices beyond this many are ignored.
pub const MEDIA_STREAM_CAP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: MediaKind,
}

/// One block of captured audio, interleaved as delivered by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_micros(per_channel * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// A live capture source. Stopping unlocks the underlying hardware.
pub trait CaptureTrack: Send + Sync {
    fn stop(&self);

    /// Subscribes to captured audio. None for sources that produce no frames.
    fn frames(&self) -> Option<broadcast::Receiver<Arc<AudioFrame>>> {
        None
    }
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;
    async fn open(&self, device: &DeviceInfo) -> Result<Arc<dyn CaptureTrack>>;
}

/// Handle to one acquired device stream.
#[derive(Clone)]
pub struct LocalStream {
    pub index: usize,
    pub stream_id: String,
    pub device: DeviceInfo,
    track: Arc<dyn CaptureTrack>,
}

impl LocalStream {
    pub fn info(&self) -> LocalStreamInfo {
        LocalStreamInfo {
            index: self.index,
            stream_id: self.stream_id.clone(),
            label: self.device.label.clone(),
            kind: self.device.kind,
        }
    }

    pub fn frames(&self) -> Option<broadcast::Receiver<Arc<AudioFrame>>> {
        self.track.frames()
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("index", &self.index)
            .field("stream_id", &self.stream_id)
            .field("device", &self.device)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStreamInfo {
    pub index: usize,
    pub stream_id: String,
    pub label: String,
    pub kind: MediaKind,
}

/// Ordered, index-stable set of local streams for one room session.
///
/// Every stream is stopped exactly once, either by [`MediaSourceSet::release`]
/// or when the set is dropped.
pub struct MediaSourceSet {
    streams: Vec<LocalStream>,
    released: bool,
}

impl MediaSourceSet {
    pub fn empty() -> Self {
        Self { streams: Vec::new(), released: false }
    }

    /// Opens up to `max_streams` devices (never more than [`MEDIA_STREAM_CAP`]).
    /// Devices that fail to open are skipped.
    pub async fn acquire(backend: &dyn CaptureBackend, max_streams: usize) -> Self {
        let cap = max_streams.min(MEDIA_STREAM_CAP);
        let devices = match backend.enumerate().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, continuing without local media");
                return Self::empty();
            }
        };

        if devices.len() > cap {
            debug!(available = devices.len(), cap, "Ignoring devices beyond the cap");
        }

        let mut streams = Vec::with_capacity(cap);
        for device in devices.into_iter().take(cap) {
            match backend.open(&device).await {
                Ok(track) => {
                    let index = streams.len();
                    streams.push(LocalStream {
                        index,
                        stream_id: format!("local-{}-{}", index, device.id),
                        device,
                        track,
                    });
                }
                Err(e) => {
                    warn!(device = %device.label, error = %e, "Skipping capture device");
                }
            }
        }

        info!(streams = streams.len(), "Local media acquired");
        Self { streams, released: false }
    }

    pub fn get(&self, index: usize) -> Option<&LocalStream> {
        if self.released {
            return None;
        }
        self.streams.get(index)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn infos(&self) -> Vec<LocalStreamInfo> {
        if self.released {
            return Vec::new();
        }
        self.streams.iter().map(LocalStream::info).collect()
    }

    /// Stops every stream. Returns how many were stopped by this call.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        for stream in &self.streams {
            stream.track.stop();
        }
        debug!(streams = self.streams.len(), "Local media released");
        self.streams.len()
    }
}

impl Drop for MediaSourceSet {
    fn drop(&mut self) {
        self.release();
    }
}
