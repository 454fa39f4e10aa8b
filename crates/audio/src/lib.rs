//! Audio device I/O and echo cancellation
//!
//! - [`AudioCapture`]: owns the input device, emits fixed-cadence PCM frames
//! - [`AudioPlayback`]: owns the output device, supports immediate abort and
//!   mirrors every submitted frame on a reference tap
//! - [`AecProcessor`]: cancels the assistant's own voice out of the capture
//!   signal using the reference tap (or the second channel of an aggregate
//!   device)

pub mod aec;
pub mod capture;
pub mod playback;

pub use aec::{AecProcessor, AecStats};
pub use capture::{list_input_devices, list_output_devices, AudioCapture, CaptureConfig};
pub use playback::{AudioPlayback, PlaybackConfig};
