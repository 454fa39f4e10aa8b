//! Realtime streaming pipeline
//!
//! Wires capture, echo cancellation, recognition, generation, synthesis and
//! playback into one full-duplex pipeline with barge-in semantics:
//! - the orchestrator owns the turn state machine and the per-turn
//!   cancellation token,
//! - the barge-in controller watches transcripts and playback state and
//!   cancels the in-flight turn when the user starts speaking,
//! - stages talk over bounded channels and observe cancellation at every
//!   I/O wait.

pub mod barge_in;
pub mod events;
pub mod orchestrator;
pub mod testing;

pub use barge_in::BargeInConfig;
pub use events::PipelineEvent;
pub use orchestrator::{Pipeline, PipelineConfig, PipelineDeps};
