//! Role library
//!
//! A role supplies the system prompt and style constraints for the assistant.
//! Four roles ship built in; config selects one by id.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One assistant persona
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    /// Soft reply-length constraint; advisory, not enforced by the pipeline
    pub max_reply_chars: usize,
    pub style_tags: Vec<String>,
}

impl RoleConfig {
    fn new(
        id: &str,
        name: &str,
        system_prompt: &str,
        max_reply_chars: usize,
        style_tags: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            max_reply_chars,
            style_tags: style_tags.iter().map(|s| (*s).into()).collect(),
        }
    }
}

/// Built-in role set
#[derive(Debug, Clone)]
pub struct RoleLibrary {
    roles: Vec<RoleConfig>,
}

impl RoleLibrary {
    pub fn builtin() -> Self {
        let base = "You are a voice assistant. Replies are spoken aloud: answer in short, \
                    natural sentences and never use markdown, lists, or code formatting.";
        Self {
            roles: vec![
                RoleConfig::new("default", "Assistant", base, 300, &["concise", "helpful"]),
                RoleConfig::new(
                    "casual",
                    "Casual",
                    &format!("{base} Keep the tone relaxed and conversational, like chatting with a friend."),
                    240,
                    &["relaxed", "friendly"],
                ),
                RoleConfig::new(
                    "professional",
                    "Professional",
                    &format!("{base} Keep the tone precise and businesslike; lead with the answer."),
                    400,
                    &["precise", "formal"],
                ),
                RoleConfig::new(
                    "companion",
                    "Companion",
                    &format!("{base} Be warm and attentive; remember what the user tells you about themselves."),
                    240,
                    &["warm", "attentive"],
                ),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Result<&RoleConfig, ConfigError> {
        self.roles
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ConfigError::UnknownRole(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.roles.iter().map(|r| r.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roles_resolve() {
        let library = RoleLibrary::builtin();
        for id in ["default", "casual", "professional", "companion"] {
            let role = library.get(id).unwrap();
            assert!(!role.system_prompt.is_empty());
            assert!(role.max_reply_chars > 0);
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        let library = RoleLibrary::builtin();
        assert!(matches!(
            library.get("pirate"),
            Err(ConfigError::UnknownRole(_))
        ));
    }
}
