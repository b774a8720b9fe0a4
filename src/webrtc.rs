use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use crate::error::{AppError, Result};
use crate::media::{AudioFrame, LocalStream, MediaKind};
use crate::peer::{LinkContext, PeerLink, PeerLinkFactory, RemoteStream, Role};
use crate::signaling::Signal;

/// Builds peer links on the `webrtc` stack.
///
/// Negotiation is non-trickle: each offer and answer is sent once ICE
/// gathering has completed, so one payload per negotiation step.
pub struct RtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcLinkFactory {
    pub fn new(stun_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

/// G.711 runs at a fixed 8 kHz, mono.
const PCMU_CLOCK_RATE: u32 = 8_000;

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: PCMU_CLOCK_RATE,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
    }
}

fn rtp_kind(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// Adds the outbound track and, for audio with a frame source, starts the
/// task that feeds it.
async fn bind_local_stream(
    peer_connection: &RTCPeerConnection,
    stream: &LocalStream,
    participant: &str,
) -> Result<Option<JoinHandle<()>>> {
    let track = Arc::new(TrackLocalStaticSample::new(
        codec_for(stream.device.kind),
        format!("{}-{}", stream.stream_id, stream.device.kind),
        stream.stream_id.clone(),
    ));
    peer_connection
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    match (stream.device.kind, stream.frames()) {
        (MediaKind::Audio, Some(frames)) => Ok(Some(spawn_sample_writer(track, frames, participant.to_string()))),
        (kind, _) => {
            debug!(participant = %participant, stream = %stream.stream_id, %kind, "No frame source for local stream");
            Ok(None)
        }
    }
}

fn spawn_sample_writer(
    track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<Arc<AudioFrame>>,
    participant: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let Some(sample) = pcmu_sample(&frame) else {
                        continue;
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        debug!(participant = %participant, error = %e, "Failed to write audio sample");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(participant = %participant, skipped, "Sample writer fell behind capture");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(participant = %participant, "Sample writer stopped");
    })
}

/// Downmixes a captured frame to mono, resamples it to 8 kHz by averaging
/// and encodes it as G.711 mu-law.
fn pcmu_sample(frame: &AudioFrame) -> Option<Sample> {
    if frame.sample_rate == 0 || frame.channels == 0 {
        return None;
    }
    let mono: Vec<f32> = frame
        .samples
        .chunks(usize::from(frame.channels))
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect();
    let out_len = (mono.len() as u64 * u64::from(PCMU_CLOCK_RATE) / u64::from(frame.sample_rate)) as usize;
    if out_len == 0 {
        return None;
    }

    let payload: Vec<u8> = (0..out_len)
        .map(|i| {
            let start = i * mono.len() / out_len;
            let end = ((i + 1) * mono.len() / out_len).max(start + 1);
            let window = &mono[start..end];
            linear_to_ulaw(window.iter().sum::<f32>() / window.len() as f32)
        })
        .collect();

    Some(Sample {
        data: payload.into(),
        duration: Duration::from_micros(out_len as u64 * 1_000_000 / u64::from(PCMU_CLOCK_RATE)),
        timestamp: SystemTime::now(),
        ..Default::default()
    })
}

fn linear_to_ulaw(sample: f32) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let pcm = (sample.clamp(-1.0, 1.0) * 32_767.0) as i32;
    let sign = if pcm < 0 { 0x80 } else { 0 };
    let magnitude = pcm.abs().min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    async fn create(&self, ctx: LinkContext) -> Result<Box<dyn PeerLink>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let participant = ctx.participant.clone();

        let (sending, writer) = match &ctx.local_stream {
            Some(stream) => {
                let writer = bind_local_stream(&peer_connection, stream, &participant).await?;
                (Some(rtp_kind(stream.device.kind)), writer)
            }
            None => {
                debug!(participant = %participant, "No local stream, receive only");
                (None, None)
            }
        };

        // The offer must advertise every kind we want to receive.
        if ctx.role == Role::Initiator {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                if sending == Some(kind) {
                    continue;
                }
                peer_connection
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
        }

        let observer = ctx.observer.clone();
        let announced = Arc::new(Mutex::new(HashSet::new()));
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let stream = RemoteStream {
                    stream_id: track.stream_id(),
                    track_ids: vec![track.id()],
                };
                let first = announced
                    .lock()
                    .map(|mut seen| seen.insert(stream.stream_id.clone()))
                    .unwrap_or(false);
                if first {
                    debug!(participant = %observer.participant(), stream = %stream.stream_id, kind = %track.kind(), "Remote stream");
                    observer.remote_stream(stream);
                }
                Box::pin(async {})
            },
        ));

        let observer = ctx.observer.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!(participant = %observer.participant(), "Peer Connection State has changed: {}", s);
            if s == RTCPeerConnectionState::Failed {
                observer.failed("peer connection failed");
            }
            Box::pin(async {})
        }));

        info!(participant = %participant, role = ?ctx.role, "WebRTC peer connection created");
        Ok(Box::new(RtcPeerLink {
            peer_connection,
            participant,
            writer,
            closed: false,
        }))
    }
}

pub struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    participant: String,
    /// Feeds captured audio into the outbound track.
    writer: Option<JoinHandle<()>>,
    closed: bool,
}

impl RtcPeerLink {
    /// Sets `description` locally and waits for ICE gathering so the
    /// returned payload carries every candidate.
    async fn settle_local(&self, description: RTCSessionDescription) -> Result<Signal> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(description).await?;
        let _ = gather_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| AppError::Protocol("local description missing after gathering".into()))?;
        Ok(Signal::new(serde_json::to_value(&local)?))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn negotiate(&mut self) -> Result<Signal> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.settle_local(offer).await
    }

    async fn apply_signal(&mut self, signal: Signal) -> Result<Option<Signal>> {
        let description: RTCSessionDescription = serde_json::from_value(signal.into_inner())?;
        match description.sdp_type {
            RTCSdpType::Offer => {
                self.peer_connection.set_remote_description(description).await?;
                let answer = self.peer_connection.create_answer(None).await?;
                Ok(Some(self.settle_local(answer).await?))
            }
            RTCSdpType::Answer => {
                self.peer_connection.set_remote_description(description).await?;
                Ok(None)
            }
            other => Err(AppError::Protocol(format!(
                "unexpected {} description from {}",
                other, self.participant
            ))),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(writer) = self.writer.take() {
            writer.abort();
            let _ = writer.await;
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!(participant = %self.participant, error = %e, "Closing peer connection failed");
        }
    }
}
