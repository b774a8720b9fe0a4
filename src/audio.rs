use anyhow::Result as AnyResult;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use crate::error::{AppError, Result};
use crate::media::{AudioFrame, CaptureBackend, CaptureTrack, DeviceInfo, MediaKind};

const FRAME_TAP_CAPACITY: usize = 64;

/// Capture backend over the host's cpal input devices.
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureBackend for CpalCapture {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let names = tokio::task::spawn_blocking(|| -> AnyResult<Vec<String>> {
            let host = cpal::default_host();
            let mut names = Vec::new();
            for device in host.input_devices()? {
                names.push(device.name()?);
            }
            Ok(names)
        })
        .await
        .map_err(|e| AppError::Device(format!("enumeration task failed: {}", e)))?
        .map_err(|e| AppError::Device(e.to_string()))?;

        Ok(names
            .into_iter()
            .map(|name| DeviceInfo {
                id: name.clone(),
                label: name,
                kind: MediaKind::Audio,
            })
            .collect())
    }

    async fn open(&self, device: &DeviceInfo) -> Result<Arc<dyn CaptureTrack>> {
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (frames, _) = broadcast::channel(FRAME_TAP_CAPACITY);

        let name = device.id.clone();
        let tap = frames.clone();
        // cpal streams are not Send; each one lives on its own thread until stopped.
        std::thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let stream = match open_input_stream(&name, tap) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                debug!(device = %name, "Capture thread stopped");
            })?;

        ready_rx
            .await
            .map_err(|_| AppError::Device(format!("{} capture thread exited", device.label)))?
            .map_err(AppError::Device)?;

        Ok(Arc::new(CpalTrack {
            stop: Mutex::new(Some(stop_tx)),
            frames,
        }))
    }
}

/// One running cpal input stream.
pub struct CpalTrack {
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
    frames: broadcast::Sender<Arc<AudioFrame>>,
}

impl CaptureTrack for CpalTrack {
    fn stop(&self) {
        let sender = match self.stop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn frames(&self) -> Option<broadcast::Receiver<Arc<AudioFrame>>> {
        Some(self.frames.subscribe())
    }
}

fn open_input_stream(name: &str, tap: broadcast::Sender<Arc<AudioFrame>>) -> AnyResult<cpal::Stream> {
    let host = cpal::default_host();
    let input_device = host
        .input_devices()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| anyhow::anyhow!("Input device {} is gone", name))?;

    let config = input_device.default_input_config()?;
    debug!(device = %name, ?config, "Input config");

    let input_stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&input_device, &config.into(), tap)?,
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &config.into(), tap)?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &config.into(), tap)?,
        sample_format => return Err(anyhow::anyhow!("Unsupported sample format: {:?}", sample_format)),
    };

    input_stream.play()?;
    Ok(input_stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tap: broadcast::Sender<Arc<AudioFrame>>,
) -> AnyResult<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!("An error occurred on the input audio stream: {}", err);
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<f32> = data.iter().map(|sample| f32::from_sample_(*sample)).collect();
            // No subscribers is fine.
            let _ = tap.send(Arc::new(AudioFrame { samples, sample_rate, channels }));
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
