//! Turn lifecycle: identity, state machine states, outcome

use crate::error::ErrorKind;

/// Monotonically increasing identifier of one user→assistant turn.
///
/// All artifacts of a turn (transcripts, tokens, utterances, audio frames)
/// carry this id; at most one turn is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TurnId(u64);

impl TurnId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "turn#{}", self.0)
    }
}

/// Orchestrator state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Recognizing,
    Generating,
    Speaking,
    Draining,
    Cancelling,
    Completed,
    Failed,
}

impl TurnState {
    /// States in which the assistant is producing or playing a reply and a
    /// new user utterance counts as barge-in
    pub fn is_assistant_active(self) -> bool {
        matches!(
            self,
            TurnState::Generating | TurnState::Speaking | TurnState::Draining
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed)
    }
}

/// Why a turn was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The user started speaking (or typed) while the assistant was replying
    BargeIn,
    /// Caller-requested cancellation
    Explicit,
}

/// Result of one turn, surfaced on the status channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled(CancelReason),
    Failed(ErrorKind),
}

/// Status channel payload: the latest finished turn and how it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub turn: TurnId,
    pub outcome: TurnOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_ids_are_ordered() {
        let a = TurnId::new(1);
        assert!(a.next() > a);
        assert_eq!(a.next().value(), 2);
    }

    #[test]
    fn assistant_active_window() {
        assert!(TurnState::Generating.is_assistant_active());
        assert!(TurnState::Speaking.is_assistant_active());
        assert!(TurnState::Draining.is_assistant_active());
        assert!(!TurnState::Listening.is_assistant_active());
        assert!(!TurnState::Cancelling.is_assistant_active());
    }
}
