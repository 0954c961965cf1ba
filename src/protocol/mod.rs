pub mod completion;

use serde::{Deserialize, Serialize};

pub use completion::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message exchanged in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Body of `/chat` and `/message/stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    pub message: String,
    pub session_token: String,
}

impl MessageRequest {
    /// Extract both fields from a raw request body.
    ///
    /// Returns `None` when the body is not a JSON object or either field is
    /// missing, not a string, or empty. Whitespace-only values are accepted.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .filter(|text| !text.is_empty())
                .map(str::to_owned)
        };
        Some(Self {
            message: field("message")?,
            session_token: field("sessionToken")?,
        })
    }
}
