//! Turn coordination: one user-utterance-to-persisted-response cycle.
//!
//! The coordinator sequences a turn against its two backends: append the
//! utterance to the transcript, stream the completion to a fragment
//! callback, extract metadata from the accumulated transcript, merge it,
//! and persist. Failures propagate with their original identity; the
//! utterance stays in the transcript regardless, so history records what
//! was actually asked.
//!
//! Callers serialize turns per conversation; the coordinator only rejects
//! overlapping calls on the same instance.

use crate::config::ChatOptions;
use crate::conversation::{Conversation, ConversationItem};
use crate::llm::{CompletionBackend, ExtractionBackend, LlmError};
use crate::metadata::ChatInfo;
use crate::store::{ConversationFile, StoreError};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("a turn is already in flight on this coordinator")]
    Busy,
}

/// Where a coordinator currently is in its turn cycle.
///
/// `Failed` is terminal for a turn only: the next `execute_turn` starts
/// fresh from it exactly as from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TurnPhase {
    Idle = 0,
    Streaming = 1,
    Extracting = 2,
    Persisting = 3,
    Failed = 4,
}

impl TurnPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Streaming,
            2 => Self::Extracting,
            3 => Self::Persisting,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Outcome of a detached metadata refresh, delivered over the coordinator's
/// notification channel instead of being raised (that path has no
/// synchronous caller to propagate to).
#[derive(Debug)]
pub enum MetadataNotice {
    Refreshed(ChatInfo),
    Failed(LlmError),
}

/// Sequences turns between a conversation and the two AI backends.
///
/// Shareable (`&self` methods, interior mutability); the conversation is
/// borrowed mutably only for the duration of a call.
pub struct TurnCoordinator<C, E> {
    completion: C,
    extraction: E,
    options: ChatOptions,
    pending_reset: AtomicBool,
    in_flight: AtomicBool,
    phase: AtomicU8,
    store: Mutex<Option<ConversationFile>>,
    notify: Option<mpsc::UnboundedSender<MetadataNotice>>,
}

impl<C, E> TurnCoordinator<C, E>
where
    C: CompletionBackend,
    E: ExtractionBackend,
{
    pub fn new(completion: C, extraction: E, options: ChatOptions) -> Self {
        Self {
            completion,
            extraction,
            options,
            pending_reset: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            phase: AtomicU8::new(TurnPhase::Idle as u8),
            store: Mutex::new(None),
            notify: None,
        }
    }

    /// Attach a channel for detached metadata refresh outcomes.
    pub fn with_notifications(mut self, notify: mpsc::UnboundedSender<MetadataNotice>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn phase(&self) -> TurnPhase {
        TurnPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Request that the next turn drops the backend's chat history. The
    /// flag is consumed by exactly one turn.
    pub fn request_history_reset(&self) {
        self.pending_reset.store(true, Ordering::SeqCst);
    }

    /// Run one turn: append `utterance` to the transcript, stream the
    /// completion (forwarding each fragment to `on_fragment` in arrival
    /// order), extract and merge metadata, persist. Returns the
    /// accumulated response text.
    ///
    /// The coordinator appends only the user item; recording the response
    /// in the transcript is the caller's (display layer's) concern.
    pub async fn execute_turn(
        &self,
        utterance: &str,
        conversation: &mut Conversation,
        on_fragment: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<String, TurnError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(TurnError::Busy);
        }
        let result = self.run_turn(utterance, conversation, on_fragment).await;
        let end_phase = if result.is_ok() {
            TurnPhase::Idle
        } else {
            TurnPhase::Failed
        };
        self.phase.store(end_phase as u8, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_turn(
        &self,
        utterance: &str,
        conversation: &mut Conversation,
        mut on_fragment: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<String, TurnError> {
        conversation.last_kick_off_time = Duration::ZERO;
        conversation.date_last_edited = Utc::now();

        // Only the very first turn stamps the session defaults; later
        // turns never overwrite them.
        if conversation.items.is_empty() {
            conversation.model = self.options.last_used_model.clone();
            conversation.configuration_id = self.options.last_used_configuration_id;
        }

        conversation.push_item(ConversationItem::user(utterance));

        self.phase
            .store(TurnPhase::Streaming as u8, Ordering::SeqCst);
        // Consume the reset flag before the backend call so it is spent
        // exactly once even if the call fails.
        let keep_history = !self.pending_reset.swap(false, Ordering::SeqCst);
        log::info!(
            "turn: streaming completion (keep_history={}, model={})",
            keep_history,
            conversation.model
        );
        let started = std::time::Instant::now();
        let mut stream = self.completion.stream_chat(utterance, keep_history).await?;

        let mut response = String::new();
        let mut first_fragment = true;
        while let Some(fragment) = stream.next().await {
            // None fragments are valid and silently dropped.
            if let Some(text) = fragment? {
                if first_fragment {
                    // Kept on the conversation until the next append's
                    // bookkeeping picks it up.
                    conversation.last_kick_off_time = started.elapsed();
                    first_fragment = false;
                }
                if let Some(cb) = on_fragment.as_mut() {
                    cb(&text);
                }
                response.push_str(&text);
            }
        }

        self.phase
            .store(TurnPhase::Extracting as u8, Ordering::SeqCst);
        let request = format!("{}\n{}", conversation.joined_content(), utterance);
        if let Some(info) = self.extraction.extract(&request).await? {
            info.merge(conversation);
        } else {
            log::debug!("turn: extraction inconclusive, keeping metadata");
        }

        self.phase
            .store(TurnPhase::Persisting as u8, Ordering::SeqCst);
        self.persist(conversation).await?;

        Ok(response)
    }

    /// Save the conversation, lazily creating the handle bound to the
    /// configured base path and reusing it on later turns.
    async fn persist(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut guard = self.store.lock().await;
        let stale = guard
            .as_ref()
            .map(|f| f.conversation_id() != conversation.id)
            .unwrap_or(true);
        if stale {
            *guard = Some(ConversationFile::create(
                conversation,
                &self.options.base_path,
            ));
        }
        if let Some(file) = guard.as_ref() {
            file.save(conversation).await?;
        }
        Ok(())
    }

    /// Persist the conversation outside a turn, reusing the same lazily
    /// created handle. The display layer calls this after it appends the
    /// response item, so the saved transcript includes the response.
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<(), TurnError> {
        Ok(self.persist(conversation).await?)
    }

    /// Refresh title/summary/tags from the completion backend's standing
    /// history, independent of a turn. Never persists; the outcome (merged
    /// record or failure) goes to the notification channel.
    pub async fn refresh_metadata(&self, conversation: &mut Conversation) {
        let joined = self.completion.history().await.join("\n");
        match self.extraction.extract(&joined).await {
            Ok(Some(info)) => {
                info.merge(conversation);
                self.send_notice(MetadataNotice::Refreshed(info));
            }
            Ok(None) => {
                log::debug!("refresh: extraction inconclusive");
            }
            Err(e) => {
                log::warn!("refresh: extraction failed: {}", e);
                self.send_notice(MetadataNotice::Failed(e));
            }
        }
    }

    /// Load a saved conversation from the base path and replay its items
    /// into the completion backend's history, replacing whatever was
    /// there. The persistence handle is rebound to the loaded file.
    pub async fn load_conversation(&self, filename: &str) -> Result<Conversation, TurnError> {
        let (file, conversation) =
            ConversationFile::load(&self.options.base_path, filename).await?;
        self.completion.reset_history().await;
        for item in &conversation.items {
            self.completion
                .push_history(item.is_response, &item.markdown_content)
                .await;
        }
        *self.store.lock().await = Some(file);
        log::info!(
            "loaded conversation {} ({} items)",
            conversation.id,
            conversation.items.len()
        );
        Ok(conversation)
    }

    fn send_notice(&self, notice: MetadataNotice) {
        if let Some(tx) = &self.notify {
            // Receiver gone means nobody is listening; not an error.
            let _ = tx.send(notice);
        }
    }
}
