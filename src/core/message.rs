use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ToolOutput, UsageStats};
use crate::core::content::Content;
use crate::core::tool_calls::ToolCallAccumulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }

    pub fn is_tool(self) -> bool {
        self == Role::Tool
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Client-generated message id. The backend assigns its own persisted id
/// later; the two stay reconcilable as identifiers for the same message.
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallAccumulator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_outputs: Vec<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub comparison_results: BTreeMap<String, ComparisonResult>,
}

impl Message {
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            id: new_client_id(),
            role,
            content,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
            usage: None,
            comparison_results: BTreeMap::new(),
        }
    }

    pub fn user(content: Content) -> Self {
        Self::new(Role::User, content)
    }

    /// Empty assistant message appended at turn start, filled by deltas.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, Content::default())
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    /// No text, no tool calls, no tool outputs. Comparison payloads are
    /// judged separately per target.
    pub fn is_empty_payload(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty() && self.tool_outputs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Streaming,
    Complete,
    Error,
}

/// The per-model slot a comparison target streams into, keyed by the
/// qualified model identifier on the owning assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    pub status: ComparisonStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallAccumulator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_outputs: Vec<ToolOutput>,
}

impl ComparisonResult {
    pub fn streaming() -> Self {
        Self {
            message_id: None,
            content: Content::default(),
            usage: None,
            status: ComparisonStatus::Streaming,
            error: None,
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
        }
    }

    pub fn is_empty_payload(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty() && self.tool_outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_role_strings_are_rejected() {
        assert!(Role::try_from("moderator").is_err());
        assert_eq!(Role::try_from("tool"), Ok(Role::Tool));
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(new_client_id(), new_client_id());
    }

    #[test]
    fn placeholder_payloads_are_empty_until_streamed() {
        let mut message = Message::assistant_placeholder();
        assert!(message.is_empty_payload());
        message.content.push_text("token");
        assert!(!message.is_empty_payload());
    }

    #[test]
    fn comparison_placeholder_starts_streaming_and_empty() {
        let result = ComparisonResult::streaming();
        assert_eq!(result.status, ComparisonStatus::Streaming);
        assert!(result.is_empty_payload());
    }
}
