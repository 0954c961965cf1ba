//! Chat-completions wire types for the upstream provider.
//!
//! Only the fields the relay reads are modelled; everything else in provider
//! payloads is ignored on decode.

use serde::{Deserialize, Serialize};

use super::Turn;

/// Request body sent to `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl<'a> ChatCompletionRequest<'a> {
    #[must_use]
    pub fn new(model: &'a str, messages: &'a [Turn]) -> Self {
        Self {
            model,
            messages,
            stream: None,
        }
    }

    #[must_use]
    pub fn streaming(model: &'a str, messages: &'a [Turn]) -> Self {
        Self {
            model,
            messages,
            stream: Some(true),
        }
    }
}

/// Non-streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<CompletionMessage>,
}

/// The provider's `role` is not read: a reply is always stored as an
/// assistant turn, and roles outside [`Role`](super::Role) must not fail the decode.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletion {
    /// The first choice's message as a history turn.
    ///
    /// `content: null` becomes empty text.
    #[must_use]
    pub fn first_turn(&self) -> Option<Turn> {
        let message = self.choices.first()?.message.as_ref()?;
        Some(Turn::assistant(message.content.clone().unwrap_or_default()))
    }
}

/// One `data:` payload of a streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// Incremental text of the first choice, if it carries any.
    #[must_use]
    pub fn into_fragment(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()?
            .delta?
            .content
            .filter(|text| !text.is_empty())
    }
}
