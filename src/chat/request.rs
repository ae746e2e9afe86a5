//! Parsing and validation of `POST /chat` bodies.

use serde_json::Value;

use crate::error::ApiError;
use crate::llm::{ChatMessage, Role};
use crate::roadmap::UserSettings;

/// A validated chat turn.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Conversation so far, oldest first. Never empty.
    pub messages: Vec<ChatMessage>,
    pub user_id: Option<String>,
    /// Settings sent by the client, when they parsed.
    pub user_settings: Option<UserSettings>,
}

impl ChatTurn {
    /// Validate a raw request body.
    ///
    /// Accepts `{ messages: [{role, content}], userId?, userSettings? }` and
    /// the legacy `{ message: string }` shape.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| ApiError::validation("Invalid JSON in request body"))?;
        let Value::Object(mut fields) = value else {
            return Err(ApiError::validation(
                "Invalid request format: expected a JSON object",
            ));
        };

        let messages = match (fields.remove("messages"), fields.remove("message")) {
            (Some(Value::Array(items)), _) => parse_messages(items)?,
            (None, Some(Value::String(legacy))) => vec![ChatMessage::user(legacy)],
            _ => {
                return Err(ApiError::validation(
                    "Invalid request format: messages array required",
                ));
            }
        };

        let user_id = match fields.remove("userId") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Null) | None => None,
            Some(other) => {
                tracing::debug!(kind = %json_kind(&other), "Ignoring non-string userId");
                None
            }
        };

        let user_settings = match fields.remove("userSettings") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value::<UserSettings>(raw) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed userSettings");
                    None
                }
            },
        };

        Ok(Self {
            messages,
            user_id,
            user_settings,
        })
    }

    /// Content of the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

fn parse_messages(items: Vec<Value>) -> Result<Vec<ChatMessage>, ApiError> {
    if items.is_empty() {
        return Err(ApiError::validation(
            "Invalid request format: messages array must not be empty",
        ));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| parse_message(i, item))
        .collect()
}

fn parse_message(index: usize, item: Value) -> Result<ChatMessage, ApiError> {
    let invalid = |reason: &str| {
        ApiError::validation(format!("Invalid message format at index {index}: {reason}"))
    };
    let Value::Object(mut fields) = item else {
        return Err(invalid("expected an object"));
    };
    let role = match fields.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("system") => Role::System,
        _ => return Err(invalid("role must be one of user, assistant, system")),
    };
    let Some(Value::String(content)) = fields.remove("content") else {
        return Err(invalid("content must be a string"));
    };
    Ok(match role {
        Role::User => ChatMessage::user(content),
        Role::Assistant => ChatMessage::assistant(content),
        _ => ChatMessage::system(content),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
