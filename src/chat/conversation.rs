//! Conversation state: the ordered message log and its wire projection.

use crate::llm::{TurnStats, WireMessage};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Message author. Unknown roles keep their original name so a load/save
/// cycle writes them back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(name) => name,
        }
    }
}

impl From<String> for Role {
    fn from(name: String) -> Self {
        match name.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(name),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TurnStats>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            stats: None,
        }
    }

    /// Content as rendered: leading newlines dropped.
    pub fn display_content(&self) -> &str {
        self.content.trim_start_matches(['\n', '\r'])
    }

    fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Backing file name inside the chats directory; doubles as the chat id.
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A fresh conversation seeded with one system message.
    pub fn new(id: impl Into<String>, title: impl Into<String>, system_prompt: &str) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            messages: vec![Message::new(Role::System, system_prompt)],
        }
    }

    /// Returns false (and changes nothing) for blank input.
    pub fn append_user(&mut self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        self.messages.push(Message::new(Role::User, text));
        true
    }

    pub fn append_assistant(&mut self, text: impl Into<String>, stats: Option<TurnStats>) {
        self.messages.push(Message {
            role: Role::Assistant,
            content: text.into(),
            stats,
        });
    }

    pub fn append_system(&mut self, text: impl Into<String>) {
        self.messages.push(Message::new(Role::System, text));
    }

    /// The system message that governs the next request: the most recent one.
    pub fn effective_system(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Wire payload: the effective system message first, then every
    /// non-system message in log order.
    pub fn project_legacy(&self) -> Vec<WireMessage> {
        let mut wire = Vec::with_capacity(self.messages.len());
        if let Some(system) = self.messages.iter().rev().find(|m| m.role == Role::System) {
            wire.push(system.to_wire());
        }
        wire.extend(
            self.messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(Message::to_wire),
        );
        wire
    }

    /// Index of the newest user turn, the default regeneration anchor.
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Drop everything after the user turn at `index` and return the payload
    /// to re-send. `None` when `index` is not a user turn.
    pub fn regenerate_from(&mut self, index: usize) -> Option<Vec<WireMessage>> {
        if self.messages.get(index)?.role != Role::User {
            return None;
        }
        let dropped = self.messages.len() - index - 1;
        self.messages.truncate(index + 1);
        log::info!("[CHAT] Regenerating from turn {} ({} later turns dropped)", index, dropped);
        Some(self.project_legacy())
    }

    pub fn delete_turn(&mut self, index: usize) -> Option<Message> {
        if index >= self.messages.len() {
            return None;
        }
        Some(self.messages.remove(index))
    }
}
