//! Microphone capture
//!
//! Acquires the input device at a fixed rate and emits frames on a bounded
//! channel holding roughly two frame periods. Dropped device buffers are
//! logged and replaced with silence so the cadence downstream holds;
//! unrecoverable errors close the channel.

use std::sync::Arc;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use voiceloop_core::{AudioFrame, AudioSource, Channels, Error, Result, SampleRate};

/// Wrapper for cpal::Stream so the capture handle can cross threads.
///
/// Safe because the stream is only touched under the owner's exclusive
/// access; cpal drives its callbacks from its own audio thread.
struct SendableStream(#[allow(dead_code)] cpal::Stream);

// cpal streams are !Send only because of raw host handles; see above.
unsafe impl Send for SendableStream {}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device name substring; default device when unset
    pub device: Option<String>,
    pub sample_rate: u32,
    /// 1 for a plain microphone, 2 for an aggregate `{mic, reference}` device
    pub channels: u16,
    /// Frame cadence in milliseconds
    pub frame_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 10,
        }
    }
}

impl CaptureConfig {
    fn frame_samples(&self) -> usize {
        (self.sample_rate as usize / 1000) * self.frame_ms as usize * self.channels as usize
    }
}

/// Owns the input device and produces [`AudioFrame`] values
pub struct AudioCapture {
    config: CaptureConfig,
    stream: Option<SendableStream>,
    frame_rx: Option<mpsc::Receiver<AudioFrame>>,
}

impl AudioCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stream: None,
            frame_rx: None,
        }
    }

    fn resolve_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.config.device {
            Some(wanted) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| Error::DeviceBusy(e.to_string()))?;
                for device in devices {
                    if let Ok(name) = device.name() {
                        if name.to_lowercase().contains(&wanted.to_lowercase()) {
                            return Ok(device);
                        }
                    }
                }
                Err(Error::DeviceBusy(format!(
                    "no input device matching `{wanted}`"
                )))
            }
            None => host
                .default_input_device()
                .ok_or_else(|| Error::DeviceBusy("no default input device".into())),
        }
    }

    fn build_stream(
        &self,
        device: &cpal::Device,
        tx: mpsc::Sender<AudioFrame>,
    ) -> Result<cpal::Stream> {
        let stream_config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_samples = self.config.frame_samples();
        let sample_rate = SampleRate::from_hz(self.config.sample_rate)
            .ok_or_else(|| Error::Config(format!(
                "unsupported capture rate {} Hz",
                self.config.sample_rate
            )))?;
        let channels = if self.config.channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };

        let carry: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::with_capacity(frame_samples)));

        let err_tx = tx.clone();
        let err_callback = move |err: cpal::StreamError| {
            tracing::warn!(error = %err, "capture stream error, substituting silence");
            // keep the cadence alive through transient device hiccups
            let _ = err_tx.try_send(AudioFrame::silence(
                sample_rate,
                channels,
                frame_samples / channels.count(),
            ));
        };

        // i16 first; fall back to f32 for devices that only expose floats
        let carry_i16 = Arc::clone(&carry);
        let tx_i16 = tx.clone();
        if let Ok(stream) = device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_samples(&carry_i16, data, frame_samples, sample_rate, channels, &tx_i16);
            },
            err_callback.clone(),
            None,
        ) {
            return Ok(stream);
        }

        let carry_f32 = Arc::clone(&carry);
        device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect();
                    push_samples(&carry_f32, &converted, frame_samples, sample_rate, channels, &tx);
                },
                err_callback,
                None,
            )
            .map_err(|e| Error::DeviceBusy(e.to_string()))
    }
}

fn push_samples(
    carry: &Mutex<Vec<i16>>,
    data: &[i16],
    frame_samples: usize,
    sample_rate: SampleRate,
    channels: Channels,
    tx: &mpsc::Sender<AudioFrame>,
) {
    let mut buf = carry.lock();
    buf.extend_from_slice(data);
    while buf.len() >= frame_samples {
        let samples: Vec<i16> = buf.drain(..frame_samples).collect();
        let frame = AudioFrame::new(samples, sample_rate, channels)
            .with_captured_at(Instant::now());
        if tx.try_send(frame).is_err() {
            // consumer is behind or gone; drop the frame and move on
            tracing::trace!("capture channel full, dropping frame");
        }
    }
}

impl AudioSource for AudioCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let device = self.resolve_device()?;
        let name = device.name().unwrap_or_default();

        let (tx, rx) = mpsc::channel(2);
        let stream = self.build_stream(&device, tx)?;
        stream
            .play()
            .map_err(|e| Error::CaptureFailed(e.to_string()))?;

        tracing::debug!(
            device = %name,
            sample_rate = self.config.sample_rate,
            channels = self.config.channels,
            frame_ms = self.config.frame_ms,
            "audio capture started"
        );

        self.stream = Some(SendableStream(stream));
        self.frame_rx = Some(rx);
        Ok(())
    }

    fn frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frame_rx.take()
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// List input device names for the `--list-devices` surface
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| Error::DeviceBusy(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// List output device names
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| Error::DeviceBusy(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}
