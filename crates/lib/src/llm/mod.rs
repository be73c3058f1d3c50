//! LLM backend contracts and the Ollama client.
//!
//! Two seams: `CompletionBackend` streams chat responses and owns the
//! standing chat history; `ExtractionBackend` derives structured metadata
//! from transcript text. Both are implemented by `OllamaBackend`.

mod ollama;

pub use ollama::{ChatMessage, OllamaBackend, OllamaModel};

use crate::metadata::ChatInfo;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Lazy, finite, non-restartable sequence of response fragments.
///
/// `Ok(None)` is a valid empty fragment (keep-alive chunks from some
/// backends); consumers drop it rather than treating it as an error.
pub type FragmentStream = BoxStream<'static, Result<Option<String>, LlmError>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend api error: {0}")]
    Api(String),
}

/// Chat completion over a streaming backend that keeps its own history.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Open a streamed completion for `utterance`. When `keep_history` is
    /// false the backend drops its standing history before this utterance
    /// is recorded. The returned stream is consumed exactly once.
    async fn stream_chat(
        &self,
        utterance: &str,
        keep_history: bool,
    ) -> Result<FragmentStream, LlmError>;

    /// Content of the standing history, in order.
    async fn history(&self) -> Vec<String>;

    /// Record an item in the standing history without a model call
    /// (used when replaying a loaded conversation).
    async fn push_history(&self, is_response: bool, content: &str);

    /// Drop the standing history immediately.
    async fn reset_history(&self);
}

/// Structured metadata extraction; `Ok(None)` means the backend could not
/// derive anything reliable, which is a valid outcome and not an error.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Option<ChatInfo>, LlmError>;
}
