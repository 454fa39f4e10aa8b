//! Pipeline events and shared turn state

use parking_lot::Mutex;
use tokio::sync::broadcast;

use voiceloop_core::{Transcript, TurnId, TurnReport, TurnState};

/// Events broadcast to pipeline subscribers.
///
/// `AssistantToken` carries the raw model text for on-screen display; the
/// sanitized TTS feed is visible as `AssistantUtterance`.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    PartialTranscript(Transcript),
    FinalTranscript(Transcript),
    /// A turn began from this user text (spoken or typed)
    UserText {
        turn: TurnId,
        text: String,
    },
    AssistantToken {
        turn: TurnId,
        text: String,
    },
    AssistantUtterance {
        turn: TurnId,
        text: String,
    },
    BargeIn {
        turn: TurnId,
    },
    TurnFinished(TurnReport),
    Error {
        turn: TurnId,
        message: String,
    },
}

/// Current turn state, readable from any task, with transitions broadcast as
/// events. Only the orchestrator and the active turn task write to it.
pub struct StateCell {
    state: Mutex<TurnState>,
    events: broadcast::Sender<PipelineEvent>,
}

impl StateCell {
    pub fn new(events: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            state: Mutex::new(TurnState::Idle),
            events,
        }
    }

    pub fn get(&self) -> TurnState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, to: TurnState) {
        let mut state = self.state.lock();
        if *state != to {
            let from = *state;
            *state = to;
            drop(state);
            tracing::debug!(?from, ?to, "turn state changed");
            let _ = self.events.send(PipelineEvent::StateChanged { from, to });
        }
    }

    pub fn events(&self) -> broadcast::Sender<PipelineEvent> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_broadcast_once() {
        let (tx, mut rx) = broadcast::channel(8);
        let cell = StateCell::new(tx);

        cell.set(TurnState::Listening);
        cell.set(TurnState::Listening); // no-op
        cell.set(TurnState::Recognizing);

        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            PipelineEvent::StateChanged {
                from: TurnState::Idle,
                to: TurnState::Listening
            }
        ));
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            second,
            PipelineEvent::StateChanged {
                to: TurnState::Recognizing,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }
}
