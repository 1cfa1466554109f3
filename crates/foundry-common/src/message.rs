use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("prompt or messages are required.")]
    Empty,
}

/// Raw caller fields a conversation can be built from.
///
/// Fields stay as untyped JSON so that malformed entries can be dropped
/// instead of failing the whole body.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConversationInput<'a> {
    pub messages: Option<&'a Value>,
    pub prompt: Option<&'a Value>,
    pub system: Option<&'a Value>,
}

/// Build the canonical conversation from either a `messages` array or a
/// `prompt` (+ optional `system`) pair.
///
/// A non-empty `messages` array wins as long as at least one entry survives
/// filtering; order is preserved exactly. Otherwise a non-empty string
/// `prompt` is required.
pub fn normalize_messages(input: ConversationInput<'_>) -> Result<Vec<Message>, NormalizeError> {
    if let Some(Value::Array(items)) = input.messages {
        let normalized: Vec<Message> = items.iter().filter_map(message_from_value).collect();
        if !normalized.is_empty() {
            return Ok(normalized);
        }
    }

    let prompt = match input.prompt {
        Some(Value::String(p)) if !p.is_empty() => p,
        _ => return Err(NormalizeError::Empty),
    };

    let mut out = Vec::with_capacity(2);
    if let Some(Value::String(system)) = input.system {
        if !system.is_empty() {
            out.push(Message::new(Role::System, system.as_str()));
        }
    }
    out.push(Message::new(Role::User, prompt.as_str()));
    Ok(out)
}

fn message_from_value(value: &Value) -> Option<Message> {
    let obj = value.as_object()?;
    let role = obj.get("role").and_then(Value::as_str).and_then(Role::parse)?;
    let content = obj.get("content").and_then(Value::as_str)?;
    Some(Message::new(role, content))
}

/// Contents joined by newlines; the text that is length-checked and handed
/// to command-line providers.
pub fn conversation_text(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Character count of [`conversation_text`], separators included.
pub fn conversation_chars(messages: &[Message]) -> usize {
    let content: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    content + messages.len().saturating_sub(1)
}
