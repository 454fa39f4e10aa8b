//! Barge-in detection
//!
//! Watches ASR events while the assistant is generating, speaking or
//! draining, and cancels the in-flight turn when the user starts a new
//! utterance. The controller is authoritative over echo-cancellation
//! imperfections: with software AEC active, events that land inside the
//! grace window after the most recent playback frame are rejected as
//! residual echo, and the worst case of a false positive is a terminated
//! reply, never stray audio crossing into the next turn.
//!
//! The controller owns only read-handles (a transcript subscription, the
//! state cell, the playback clock) and a sender into the orchestrator's
//! command channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use voiceloop_core::{AudioSink, CancelReason, CancellationToken, Transcript};

use crate::events::StateCell;
use crate::orchestrator::Command;

/// Barge-in tunables
#[derive(Debug, Clone)]
pub struct BargeInConfig {
    /// Minimum trimmed transcript length (codepoints) that may fire
    pub min_chars: usize,
    /// Reject events this close to the last submitted playback frame
    /// (software AEC only)
    pub grace: Duration,
    /// Whether the echo-grace window applies
    pub software_aec_active: bool,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            min_chars: 2,
            grace: Duration::from_millis(200),
            software_aec_active: false,
        }
    }
}

pub(crate) struct BargeInController {
    config: BargeInConfig,
    state: Arc<StateCell>,
    playback: Arc<dyn AudioSink>,
    cmd_tx: mpsc::Sender<Command>,
}

impl BargeInController {
    pub(crate) fn new(
        config: BargeInConfig,
        state: Arc<StateCell>,
        playback: Arc<dyn AudioSink>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            config,
            state,
            playback,
            cmd_tx,
        }
    }

    pub(crate) async fn run(
        self,
        mut transcripts: broadcast::Receiver<Transcript>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = transcripts.recv() => event,
            };
            match event {
                Ok(transcript) => {
                    if self.should_fire(&transcript) {
                        tracing::info!(text = %transcript.text, "barge-in detected");
                        if self
                            .cmd_tx
                            .send(Command::CancelTurn(CancelReason::BargeIn))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "barge-in controller lagged on transcripts");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    pub(crate) fn should_fire(&self, transcript: &Transcript) -> bool {
        if !self.state.get().is_assistant_active() {
            return false;
        }
        let long_enough = transcript.text.trim().chars().count() >= self.config.min_chars;
        if !transcript.is_final && !long_enough {
            return false;
        }
        if self.config.software_aec_active {
            if let Some(last) = self.playback.last_submit() {
                if last.elapsed() < self.config.grace {
                    tracing::debug!(
                        text = %transcript.text,
                        "transcript inside echo grace window, ignoring"
                    );
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlayback;
    use tokio::sync::broadcast as bc;
    use voiceloop_core::TurnState;

    fn controller(config: BargeInConfig, playback: Arc<FakePlayback>) -> (BargeInController, Arc<StateCell>) {
        let (events, _) = bc::channel(16);
        let state = Arc::new(StateCell::new(events));
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        (
            BargeInController::new(config, Arc::clone(&state), playback, cmd_tx),
            state,
        )
    }

    #[tokio::test]
    async fn fires_only_while_assistant_is_active() {
        let playback = Arc::new(FakePlayback::new());
        let (controller, state) = controller(BargeInConfig::default(), Arc::clone(&playback));

        let partial = Transcript::partial("stop", 1);
        assert!(!controller.should_fire(&partial));

        state.set(TurnState::Speaking);
        assert!(controller.should_fire(&partial));

        state.set(TurnState::Cancelling);
        assert!(!controller.should_fire(&partial));
    }

    #[tokio::test]
    async fn short_partials_do_not_fire_but_finals_do() {
        let playback = Arc::new(FakePlayback::new());
        let (controller, state) = controller(BargeInConfig::default(), playback);
        state.set(TurnState::Generating);

        assert!(!controller.should_fire(&Transcript::partial("u", 1)));
        assert!(controller.should_fire(&Transcript::partial("um", 2)));
        assert!(controller.should_fire(&Transcript::final_result("u", 3)));
    }

    #[tokio::test]
    async fn grace_window_rejects_echo_after_playback() {
        let playback = Arc::new(FakePlayback::new());
        let config = BargeInConfig {
            software_aec_active: true,
            ..BargeInConfig::default()
        };
        let (controller, state) = controller(config, Arc::clone(&playback));
        state.set(TurnState::Speaking);

        // a playback frame was just submitted: the "um" is residual echo
        playback.mark_submit();
        assert!(!controller.should_fire(&Transcript::partial("um", 1)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(controller.should_fire(&Transcript::partial("um", 2)));
    }
}
