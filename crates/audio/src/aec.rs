//! Acoustic echo cancellation
//!
//! Removes the assistant's own voice from the capture signal. Two deployment
//! modes:
//!
//! - **aggregate**: the capture frame already carries `{mic, reference}`
//!   channels at the same rate; the two are sliced and cancelled in lockstep.
//! - **software**: reference frames arrive from the playback tap at the
//!   playback rate. They are resampled to the capture rate and held in a
//!   timestamped ring (>= 500 ms); for each capture frame the processor picks
//!   the reference whose play-out instant is `capture_time - stream_delay`.
//!   Silence is substituted when the ring cannot cover the requested window.
//!
//! Cancellation is a normalized-LMS adaptive filter, followed by optional
//! noise suppression (energy-floor gate) and a one-pole high-pass. The
//! software path is known to be less stable than the aggregate path; the
//! barge-in grace window remains the hard guarantee against self-triggering.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use voiceloop_core::{AudioFrame, Channels, ReferenceFrame, SampleRate};
use voiceloop_config::{AecSettings, NoiseSuppression};

/// Echo tail modelled by the adaptive filter, in milliseconds
const FILTER_TAIL_MS: usize = 32;
/// Reference ring capacity beyond the configured delay
const RING_EXTRA_MS: u64 = 500;
/// NLMS step size
const NLMS_MU: f32 = 0.5;
/// High-pass cutoff
const HIGH_PASS_HZ: f32 = 120.0;

/// Running counters, logged at session teardown
#[derive(Debug, Clone, Copy, Default)]
pub struct AecStats {
    pub frames_processed: u64,
    pub reference_frames_fed: u64,
    pub silence_reference_frames: u64,
}

impl AecStats {
    /// More than half the frames saw no usable reference
    pub fn reference_starved(&self) -> bool {
        self.frames_processed > 0
            && self.silence_reference_frames * 2 > self.frames_processed
    }
}

/// Normalized-LMS adaptive echo canceller over a circular reference history
struct Nlms {
    weights: Vec<f32>,
    history: Vec<f32>,
    pos: usize,
    energy: f32,
}

impl Nlms {
    fn new(taps: usize) -> Self {
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; taps],
            pos: 0,
            energy: 0.0,
        }
    }

    fn cancel(&mut self, reference: f32, capture: f32) -> f32 {
        let taps = self.weights.len();

        let old = self.history[self.pos];
        self.energy += reference * reference - old * old;
        if self.energy < 0.0 {
            self.energy = 0.0;
        }
        self.history[self.pos] = reference;

        let mut estimate = 0.0f32;
        for (k, w) in self.weights.iter().enumerate() {
            let idx = (self.pos + taps - k) % taps;
            estimate += w * self.history[idx];
        }

        let error = capture - estimate;
        let step = NLMS_MU * error / (1e-3 + self.energy);
        for (k, w) in self.weights.iter_mut().enumerate() {
            let idx = (self.pos + taps - k) % taps;
            *w += step * self.history[idx];
        }

        self.pos = (self.pos + 1) % taps;
        error
    }
}

/// Energy-floor noise gate
struct NoiseGate {
    floor: f32,
    smoothed: f32,
    min_gain: f32,
}

impl NoiseGate {
    fn new(level: NoiseSuppression) -> Option<Self> {
        let min_gain = match level {
            NoiseSuppression::Off => return None,
            NoiseSuppression::Low => 0.5,
            NoiseSuppression::Moderate => 0.25,
            NoiseSuppression::High => 0.1,
        };
        Some(Self {
            floor: 1e-4,
            smoothed: 0.0,
            min_gain,
        })
    }

    fn gain_for(&mut self, frame_energy: f32) -> f32 {
        self.smoothed = 0.8 * self.smoothed + 0.2 * frame_energy;
        // slow-rising minimum tracker
        if self.smoothed < self.floor {
            self.floor = self.smoothed.max(1e-7);
        } else {
            self.floor *= 1.01;
        }
        if self.smoothed < self.floor * 4.0 {
            self.min_gain
        } else {
            1.0
        }
    }
}

/// One-pole high-pass filter
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * HIGH_PASS_HZ);
        let dt = 1.0 / sample_rate as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, x: f32) -> f32 {
        let y = self.alpha * (self.prev_out + x - self.prev_in);
        self.prev_in = x;
        self.prev_out = y;
        y
    }
}

/// Echo-cancelling capture processor
pub struct AecProcessor {
    sample_rate: u32,
    stream_delay: Duration,
    nlms: Nlms,
    gate: Option<NoiseGate>,
    high_pass: Option<HighPass>,
    /// Resampled reference samples with the play-out instant of the front
    ring: VecDeque<i16>,
    ring_start: Option<Instant>,
    ring_cap: usize,
    stats: AecStats,
    /// Set when the configuration cannot be honored; frames pass through
    passthrough: bool,
}

impl AecProcessor {
    pub fn new(settings: &AecSettings, sample_rate: u32) -> Self {
        let taps = (sample_rate as usize / 1000) * FILTER_TAIL_MS;
        let ring_cap =
            (sample_rate as u64 / 1000 * (RING_EXTRA_MS + settings.stream_delay_ms as u64)) as usize;
        let passthrough = !settings.enabled;
        if passthrough {
            tracing::info!("echo cancellation disabled, capture passes through");
        }
        Self {
            sample_rate,
            stream_delay: Duration::from_millis(settings.stream_delay_ms as u64),
            nlms: Nlms::new(taps),
            gate: NoiseGate::new(settings.noise_suppression),
            high_pass: settings.high_pass.then(|| HighPass::new(sample_rate)),
            ring: VecDeque::with_capacity(ring_cap),
            ring_start: None,
            ring_cap,
            stats: AecStats::default(),
            passthrough,
        }
    }

    pub fn stats(&self) -> AecStats {
        self.stats
    }

    /// Log the session summary, warning when the reference ring was starved
    pub fn log_summary(&self) {
        let stats = self.stats;
        if stats.reference_starved() {
            tracing::warn!(
                frames = stats.frames_processed,
                silence_refs = stats.silence_reference_frames,
                "over half of capture frames had no playback reference; echo \
                 cancellation was mostly inactive"
            );
        } else {
            tracing::debug!(
                frames = stats.frames_processed,
                reference_frames = stats.reference_frames_fed,
                "echo canceller session summary"
            );
        }
    }

    /// Feed one playback reference frame (software mode)
    pub fn push_reference(&mut self, reference: &ReferenceFrame) {
        if self.passthrough {
            return;
        }
        self.stats.reference_frames_fed += 1;

        let resampled = resample(
            &reference.samples,
            reference.sample_rate.as_hz(),
            self.sample_rate,
        );
        if self.ring.is_empty() {
            self.ring_start = Some(reference.play_at);
        }
        self.ring.extend(resampled);

        while self.ring.len() > self.ring_cap {
            let overflow = self.ring.len() - self.ring_cap;
            self.ring.drain(..overflow);
            if let Some(start) = self.ring_start {
                self.ring_start = Some(
                    start + Duration::from_secs_f64(overflow as f64 / self.sample_rate as f64),
                );
            }
        }
    }

    /// Cancel echo on a mono capture frame using the reference ring
    /// (software mode)
    pub fn process_capture(&mut self, frame: &AudioFrame) -> AudioFrame {
        if self.passthrough || frame.channels() != Channels::Mono {
            return frame.clone();
        }
        self.stats.frames_processed += 1;

        let wanted = frame.samples_per_channel();
        let reference = self.aligned_reference(frame.captured_at(), wanted);
        self.cancel_frame(frame, &reference)
    }

    /// Cancel echo on an aggregate-device frame carrying `{mic, reference}`
    /// channels
    pub fn process_aggregate(&mut self, frame: &AudioFrame) -> AudioFrame {
        let Some((mic, reference)) = frame.split_channels() else {
            return frame.clone();
        };
        if self.passthrough {
            return AudioFrame::new(mic, frame.sample_rate(), Channels::Mono)
                .with_captured_at(frame.captured_at());
        }
        self.stats.frames_processed += 1;

        let mic_frame = AudioFrame::new(mic, frame.sample_rate(), Channels::Mono)
            .with_captured_at(frame.captured_at());
        self.cancel_frame(&mic_frame, &reference)
    }

    /// Pull the reference window ending `stream_delay` before the capture
    /// instant; silence when the ring cannot cover it
    fn aligned_reference(&mut self, captured_at: Instant, wanted: usize) -> Vec<i16> {
        let Some(ring_start) = self.ring_start else {
            self.stats.silence_reference_frames += 1;
            return vec![0; wanted];
        };

        let target = captured_at
            .checked_sub(self.stream_delay)
            .unwrap_or(captured_at);
        if target < ring_start {
            self.stats.silence_reference_frames += 1;
            return vec![0; wanted];
        }

        let offset = ((target - ring_start).as_secs_f64() * self.sample_rate as f64) as usize;
        if offset + wanted > self.ring.len() {
            self.stats.silence_reference_frames += 1;
            return vec![0; wanted];
        }
        self.ring.range(offset..offset + wanted).copied().collect()
    }

    fn cancel_frame(&mut self, frame: &AudioFrame, reference: &[i16]) -> AudioFrame {
        let scale = 1.0 / i16::MAX as f32;
        let mut out = Vec::with_capacity(frame.samples().len());
        let mut energy = 0.0f32;

        for (&d, &x) in frame.samples().iter().zip(reference.iter()) {
            let mut sample = self.nlms.cancel(x as f32 * scale, d as f32 * scale);
            if let Some(hp) = self.high_pass.as_mut() {
                sample = hp.apply(sample);
            }
            energy += sample * sample;
            out.push(sample);
        }
        energy /= out.len().max(1) as f32;

        let gain = self
            .gate
            .as_mut()
            .map(|g| g.gain_for(energy))
            .unwrap_or(1.0);

        let samples: Vec<i16> = out
            .into_iter()
            .map(|s| (s * gain * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();

        AudioFrame::new(samples, frame.sample_rate(), Channels::Mono)
            .with_captured_at(frame.captured_at())
    }
}

/// Linear resampler; identity when rates match
pub(crate) fn resample(samples: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * ratio;
        let idx = src as usize;
        let frac = (src - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)] as f32;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f32;
        out.push((a + (b - a) * frac) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings() -> AecSettings {
        AecSettings {
            enabled: true,
            stream_delay_ms: 40,
            noise_suppression: NoiseSuppression::Off,
            high_pass: false,
        }
    }

    /// Deterministic pseudo-noise in [-amp, amp]
    fn noise(len: usize, amp: i16, seed: &mut u64) -> Vec<i16> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let r = ((*seed >> 33) as i32 % (2 * amp as i32 + 1)) - amp as i32;
                r as i16
            })
            .collect()
    }

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / samples.len().max(1) as f64
    }

    #[test]
    fn aggregate_mode_attenuates_echo() {
        let mut aec = AecProcessor::new(&settings(), 16_000);
        let mut seed = 7u64;

        let mut raw_energy = 0.0;
        let mut out_energy = 0.0;
        // echo path: the mic hears exactly the reference channel at 60% gain
        for _ in 0..50 {
            let reference = noise(160, 8000, &mut seed);
            let interleaved: Vec<i16> = reference
                .iter()
                .flat_map(|&r| [(r as f32 * 0.6) as i16, r])
                .collect();
            let frame = AudioFrame::new(interleaved, SampleRate::Hz16000, Channels::Stereo);
            let out = aec.process_aggregate(&frame);
            raw_energy += energy(&reference.iter().map(|&r| (r as f32 * 0.6) as i16).collect::<Vec<_>>());
            out_energy += energy(out.samples());
        }
        // the adaptive filter converges well below the raw echo level
        assert!(
            out_energy < raw_energy * 0.2,
            "echo not attenuated: out={out_energy} raw={raw_energy}"
        );
    }

    #[test]
    fn missing_reference_counts_silence_and_passes_signal() {
        let mut aec = AecProcessor::new(&settings(), 16_000);
        let mut seed = 3u64;
        let samples = noise(160, 4000, &mut seed);
        let frame = AudioFrame::new(samples.clone(), SampleRate::Hz16000, Channels::Mono);

        let out = aec.process_capture(&frame);
        assert_eq!(aec.stats().silence_reference_frames, 1);
        // with a silent reference the canceller is an identity (minus float
        // rounding)
        let diff: i64 = out
            .samples()
            .iter()
            .zip(samples.iter())
            .map(|(&a, &b)| (a as i64 - b as i64).abs())
            .max()
            .unwrap_or(0);
        assert!(diff <= 1, "max sample diff {diff}");
    }

    #[test]
    fn disabled_processor_is_passthrough() {
        let mut off = settings();
        off.enabled = false;
        let mut aec = AecProcessor::new(&off, 16_000);

        let frame = AudioFrame::new(vec![100; 160], SampleRate::Hz16000, Channels::Mono);
        let out = aec.process_capture(&frame);
        assert_eq!(out.samples(), frame.samples());
        assert_eq!(aec.stats().frames_processed, 0);
    }

    #[test]
    fn reference_ring_is_bounded() {
        let mut aec = AecProcessor::new(&settings(), 16_000);
        let samples: Arc<[i16]> = vec![1i16; 2400].into();
        for _ in 0..20 {
            aec.push_reference(&ReferenceFrame::new(
                Arc::clone(&samples),
                SampleRate::Hz24000,
                Instant::now(),
            ));
        }
        assert!(aec.ring.len() <= aec.ring_cap);
        assert_eq!(aec.stats().reference_frames_fed, 20);
    }

    #[test]
    fn resample_halves_and_holds_length() {
        let input: Vec<i16> = (0..240).collect();
        let out = resample(&input, 24_000, 16_000);
        assert_eq!(out.len(), 160);
        let same = resample(&input, 16_000, 16_000);
        assert_eq!(same.len(), 240);
    }

    #[test]
    fn starvation_flag_trips_at_half() {
        let stats = AecStats {
            frames_processed: 10,
            reference_frames_fed: 0,
            silence_reference_frames: 6,
        };
        assert!(stats.reference_starved());
        let ok = AecStats {
            frames_processed: 10,
            reference_frames_fed: 10,
            silence_reference_frames: 5,
        };
        assert!(!ok.reference_starved());
    }
}
