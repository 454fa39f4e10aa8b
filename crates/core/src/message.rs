//! Conversation messages and bounded history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::turn::TurnId;

/// Speaker role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Wire-facing chat message, ordered as sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One turn artifact kept in history
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub turn: TurnId,
    pub at: DateTime<Utc>,
}

/// In-process conversation history bounded to the most recent K messages.
///
/// The system prompt is not stored here; it is prepended when building the
/// provider request. Assistant messages are appended only for turns that
/// reached `Completed` — cancelled turns leave no trace.
#[derive(Debug)]
pub struct ConversationHistory {
    messages: VecDeque<ConversationMessage>,
    capacity: usize,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>, turn: TurnId) {
        self.push(Role::User, text.into(), turn);
    }

    pub fn push_assistant(&mut self, text: impl Into<String>, turn: TurnId) {
        self.push(Role::Assistant, text.into(), turn);
    }

    fn push(&mut self, role: Role, text: String, turn: TurnId) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(ConversationMessage {
            role,
            text,
            turn,
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    /// Ordered request body, oldest first
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.text.clone(),
            })
            .collect()
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut history = ConversationHistory::new(4);
        for i in 0..6 {
            history.push_user(format!("u{i}"), TurnId::new(i));
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.to_chat_messages()[0].content, "u2");
    }

    #[test]
    fn roles_round_trip_in_order() {
        let mut history = ConversationHistory::new(8);
        history.push_user("q", TurnId::new(1));
        history.push_assistant("a", TurnId::new(1));
        let msgs = history.to_chat_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
    }
}
