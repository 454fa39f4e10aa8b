//! Speaker playback
//!
//! Owns the output device. Submitted frames queue in a sample buffer the
//! device callback drains; `submit` applies cooperative back-pressure above
//! the watermark, `abort` clears the buffer immediately, and every submitted
//! frame is mirrored on the reference tap with its intended play-out instant
//! for echo cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use voiceloop_core::{AudioFrame, AudioSink, Error, ReferenceFrame, Result, SampleRate};

/// Window within which a device write counts as "currently playing"
const PLAYING_WINDOW: Duration = Duration::from_millis(50);

/// See capture.rs; the stream is never touched after construction, it only
/// has to live as long as the playback handle.
struct SendableStream(#[allow(dead_code)] cpal::Stream);

unsafe impl Send for SendableStream {}
unsafe impl Sync for SendableStream {}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output device name substring; default device when unset
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Back-pressure watermark: `submit` blocks while more than this much
    /// audio is queued
    pub watermark_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 24_000,
            watermark_ms: 200,
        }
    }
}

struct Shared {
    queue: Mutex<std::collections::VecDeque<i16>>,
    space: Notify,
    last_submit: Mutex<Option<Instant>>,
    last_device_write: Mutex<Option<Instant>>,
}

/// Owns the output device and consumes PCM frames
pub struct AudioPlayback {
    config: PlaybackConfig,
    shared: Arc<Shared>,
    reference_tx: broadcast::Sender<ReferenceFrame>,
    _stream: SendableStream,
}

impl AudioPlayback {
    /// Acquire the output device and start the stream. The device plays
    /// silence until frames are submitted.
    pub fn new(config: PlaybackConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(wanted) => {
                let mut found = None;
                let devices = host
                    .output_devices()
                    .map_err(|e| Error::DeviceBusy(e.to_string()))?;
                for device in devices {
                    if let Ok(name) = device.name() {
                        if name.to_lowercase().contains(&wanted.to_lowercase()) {
                            found = Some(device);
                            break;
                        }
                    }
                }
                found.ok_or_else(|| {
                    Error::DeviceBusy(format!("no output device matching `{wanted}`"))
                })?
            }
            None => host
                .default_output_device()
                .ok_or_else(|| Error::DeviceBusy("no default output device".into()))?,
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            space: Notify::new(),
            last_submit: Mutex::new(None),
            last_device_write: Mutex::new(None),
        });

        let stream = Self::build_stream(&device, &config, Arc::clone(&shared))?;
        stream
            .play()
            .map_err(|e| Error::Playback(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            watermark_ms = config.watermark_ms,
            "audio playback started"
        );

        let (reference_tx, _) = broadcast::channel(64);
        Ok(Self {
            config,
            shared,
            reference_tx,
            _stream: SendableStream(stream),
        })
    }

    fn build_stream(
        device: &cpal::Device,
        config: &PlaybackConfig,
        shared: Arc<Shared>,
    ) -> Result<cpal::Stream> {
        let stream_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err: cpal::StreamError| {
            tracing::error!(error = %err, "playback stream error");
        };

        let shared_i16 = Arc::clone(&shared);
        let shared_f32 = shared;
        let write_f32 = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = shared_f32.queue.lock();
            let mut wrote = false;
            for slot in data.iter_mut() {
                *slot = match queue.pop_front() {
                    Some(s) => {
                        wrote = true;
                        s as f32 / i16::MAX as f32
                    }
                    None => 0.0,
                };
            }
            drop(queue);
            if wrote {
                *shared_f32.last_device_write.lock() = Some(Instant::now());
            }
            shared_f32.space.notify_waiters();
        };

        let write_i16 = move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
            let mut queue = shared_i16.queue.lock();
            let mut wrote = false;
            for slot in data.iter_mut() {
                *slot = match queue.pop_front() {
                    Some(s) => {
                        wrote = true;
                        s
                    }
                    None => 0,
                };
            }
            drop(queue);
            if wrote {
                *shared_i16.last_device_write.lock() = Some(Instant::now());
            }
            shared_i16.space.notify_waiters();
        };

        if let Ok(stream) =
            device.build_output_stream(&stream_config, write_i16, err_callback, None)
        {
            return Ok(stream);
        }
        device
            .build_output_stream(&stream_config, write_f32, err_callback, None)
            .map_err(|e| Error::DeviceBusy(e.to_string()))
    }

    fn queued(&self) -> Duration {
        let samples = self.shared.queue.lock().len();
        Duration::from_secs_f64(samples as f64 / self.config.sample_rate as f64)
    }
}

#[async_trait]
impl AudioSink for AudioPlayback {
    async fn submit(&self, frame: AudioFrame) -> Result<()> {
        // cooperative back-pressure above the watermark
        let watermark = Duration::from_millis(self.config.watermark_ms);
        while self.queued() > watermark {
            let notified = self.shared.space.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }

        let play_at = Instant::now() + self.queued();
        let samples: Arc<[i16]> = frame.samples().into();

        {
            let mut queue = self.shared.queue.lock();
            queue.extend(samples.iter().copied());
        }
        *self.shared.last_submit.lock() = Some(Instant::now());

        let rate = SampleRate::from_hz(self.config.sample_rate)
            .unwrap_or(SampleRate::Hz24000);
        let _ = self
            .reference_tx
            .send(ReferenceFrame::new(samples, rate, play_at));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        while !self.shared.queue.lock().is_empty() {
            let notified = self.shared.space.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        // one callback period so the device's own buffer runs dry
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    fn abort(&self) {
        self.shared.queue.lock().clear();
        self.shared.space.notify_waiters();
    }

    fn is_playing(&self) -> bool {
        let wrote_recently = self
            .shared
            .last_device_write
            .lock()
            .map(|at| at.elapsed() < PLAYING_WINDOW)
            .unwrap_or(false);
        wrote_recently && !self.shared.queue.lock().is_empty()
    }

    fn last_submit(&self) -> Option<Instant> {
        *self.shared.last_submit.lock()
    }

    fn reference_frames(&self) -> broadcast::Receiver<ReferenceFrame> {
        self.reference_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voiceloop_core::Channels;

    #[tokio::test]
    #[ignore] // requires audio hardware
    async fn submit_abort_round_trip() {
        let playback = AudioPlayback::new(PlaybackConfig::default()).expect("open output");
        let mut tap = playback.reference_frames();

        let frame = AudioFrame::silence(SampleRate::Hz24000, Channels::Mono, 240);
        playback.submit(frame).await.unwrap();
        assert!(tap.try_recv().is_ok());
        assert!(playback.last_submit().is_some());

        playback.abort();
        playback.abort(); // idempotent
        playback.flush().await.unwrap();
        assert!(!playback.is_playing());
    }
}
