//! Audio frame types
//!
//! Frames are immutable spans of linear PCM. Capture frames are 10 ms at
//! 16 kHz mono by default; playback frames commonly run at 24 kHz.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::turn::TurnId;

/// Supported PCM sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    /// Rate in Hz
    pub const fn as_hz(self) -> u32 {
        match self {
            SampleRate::Hz16000 => 16_000,
            SampleRate::Hz24000 => 24_000,
            SampleRate::Hz48000 => 48_000,
        }
    }

    /// Parse a raw Hz value
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            16_000 => Some(SampleRate::Hz16000),
            24_000 => Some(SampleRate::Hz24000),
            48_000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }

    /// Samples per channel for a window of the given duration
    pub const fn samples_for_ms(self, ms: u32) -> usize {
        (self.as_hz() as usize / 1000) * ms as usize
    }
}

/// Channel layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    Mono,
    /// Interleaved two-channel. In aggregate-device capture the channels are
    /// `{microphone, reference}` in that order.
    Stereo,
}

impl Channels {
    pub const fn count(self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// An immutable span of signed 16-bit PCM samples.
///
/// The declared sample count is always the payload length; `new` rejects
/// payloads that do not divide evenly into the channel layout.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: SampleRate,
    channels: Channels,
    captured_at: Instant,
    turn: Option<TurnId>,
}

impl AudioFrame {
    /// Create a frame from interleaved samples.
    ///
    /// # Panics
    ///
    /// Panics if the sample count is not a multiple of the channel count.
    pub fn new(samples: Vec<i16>, sample_rate: SampleRate, channels: Channels) -> Self {
        assert!(
            samples.len() % channels.count() == 0,
            "payload of {} samples does not fit {} channel(s)",
            samples.len(),
            channels.count()
        );
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            captured_at: Instant::now(),
            turn: None,
        }
    }

    /// A silent frame with the given per-channel length
    pub fn silence(sample_rate: SampleRate, channels: Channels, samples_per_channel: usize) -> Self {
        Self::new(
            vec![0i16; samples_per_channel * channels.count()],
            sample_rate,
            channels,
        )
    }

    /// Tag the frame with the turn it belongs to
    pub fn with_turn(mut self, turn: TurnId) -> Self {
        self.turn = Some(turn);
        self
    }

    /// Override the capture instant (used when slicing or synthesizing frames)
    pub fn with_captured_at(mut self, at: Instant) -> Self {
        self.captured_at = at;
        self
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn turn(&self) -> Option<TurnId> {
        self.turn
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.count()
    }

    /// Play-out duration of the frame
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_channel() as f64 / self.sample_rate.as_hz() as f64)
    }

    /// Mean signal energy in dBFS; -120.0 for digital silence
    pub fn energy_db(&self) -> f32 {
        if self.samples.is_empty() {
            return -120.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let n = s as f64 / i16::MAX as f64;
                n * n
            })
            .sum();
        let mean = sum_sq / self.samples.len() as f64;
        if mean <= 1e-12 {
            -120.0
        } else {
            (10.0 * mean.log10()) as f32
        }
    }

    /// Split an interleaved stereo frame into `(left, right)` channels.
    ///
    /// In aggregate-device capture, left is the microphone and right the
    /// playback reference.
    pub fn split_channels(&self) -> Option<(Vec<i16>, Vec<i16>)> {
        if self.channels != Channels::Stereo {
            return None;
        }
        let mut left = Vec::with_capacity(self.samples.len() / 2);
        let mut right = Vec::with_capacity(self.samples.len() / 2);
        for pair in self.samples.chunks_exact(2) {
            left.push(pair[0]);
            right.push(pair[1]);
        }
        Some((left, right))
    }
}

/// A copy of a frame submitted to the output device, stamped with the instant
/// the samples are expected to reach the speaker. Mirrored by the playback
/// reference tap and consumed by echo cancellation.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pub samples: Arc<[i16]>,
    pub sample_rate: SampleRate,
    pub play_at: Instant,
}

impl ReferenceFrame {
    pub fn new(samples: Arc<[i16]>, sample_rate: SampleRate, play_at: Instant) -> Self {
        Self {
            samples,
            sample_rate,
            play_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_matches_descriptor() {
        let frame = AudioFrame::new(vec![0; 320], SampleRate::Hz16000, Channels::Stereo);
        assert_eq!(frame.samples_per_channel(), 160);
        assert_eq!(frame.duration(), Duration::from_millis(10));
    }

    #[test]
    #[should_panic]
    fn odd_payload_rejected_for_stereo() {
        let _ = AudioFrame::new(vec![0; 161], SampleRate::Hz16000, Channels::Stereo);
    }

    #[test]
    fn silence_is_quiet() {
        let frame = AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, 160);
        assert!(frame.energy_db() <= -119.0);
    }

    #[test]
    fn split_interleaved_channels() {
        let frame = AudioFrame::new(vec![1, -1, 2, -2], SampleRate::Hz16000, Channels::Stereo);
        let (mic, reference) = frame.split_channels().unwrap();
        assert_eq!(mic, vec![1, 2]);
        assert_eq!(reference, vec![-1, -2]);
    }

    #[test]
    fn mono_has_no_split() {
        let frame = AudioFrame::silence(SampleRate::Hz16000, Channels::Mono, 160);
        assert!(frame.split_channels().is_none());
    }

    #[test]
    fn energy_of_full_scale_tone() {
        let samples: Vec<i16> = (0..160)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN + 1 })
            .collect();
        let frame = AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono);
        assert!(frame.energy_db() > -1.0);
    }
}
