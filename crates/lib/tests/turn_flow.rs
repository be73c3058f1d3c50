//! Integration tests: full turn cycles against in-process mock backends
//! and a temp-dir conversation store.

use async_trait::async_trait;
use futures_util::StreamExt;
use lib::config::ChatOptions;
use lib::conversation::{Conversation, ConversationItem};
use lib::llm::{CompletionBackend, ExtractionBackend, FragmentStream, LlmError};
use lib::metadata::ChatInfo;
use lib::store::ConversationFile;
use lib::turn::{MetadataNotice, TurnCoordinator, TurnError, TurnPhase};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

fn temp_base() -> PathBuf {
    std::env::temp_dir().join(format!("parley-turn-test-{}", Uuid::new_v4()))
}

fn options(base: PathBuf) -> ChatOptions {
    ChatOptions {
        base_path: base,
        last_used_model: "llama3.2:latest".to_string(),
        last_used_configuration_id: Uuid::new_v4(),
    }
}

/// Completion mock: yields configured fragments, records keep_history per
/// call, and keeps a standing history like the real client.
struct MockCompletion {
    fragments: Vec<Option<String>>,
    fail_mid_stream: StdMutex<bool>,
    keep_history_calls: Arc<StdMutex<Vec<bool>>>,
    history: Arc<Mutex<Vec<String>>>,
}

impl MockCompletion {
    fn new(fragments: &[Option<&str>]) -> Self {
        Self {
            fragments: fragments
                .iter()
                .map(|f| f.map(str::to_string))
                .collect(),
            fail_mid_stream: StdMutex::new(false),
            keep_history_calls: Arc::new(StdMutex::new(Vec::new())),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn fail_next_stream(&self) {
        *self.fail_mid_stream.lock().unwrap() = true;
    }
}

#[async_trait]
impl CompletionBackend for MockCompletion {
    async fn stream_chat(
        &self,
        utterance: &str,
        keep_history: bool,
    ) -> Result<FragmentStream, LlmError> {
        self.keep_history_calls.lock().unwrap().push(keep_history);
        {
            let mut history = self.history.lock().await;
            if !keep_history {
                history.clear();
            }
            history.push(utterance.to_string());
        }
        let mut items: Vec<Result<Option<String>, LlmError>> =
            self.fragments.iter().cloned().map(Ok).collect();
        if std::mem::take(&mut *self.fail_mid_stream.lock().unwrap()) {
            items.push(Err(LlmError::Api("stream interrupted".to_string())));
        }
        Ok(futures_util::stream::iter(items).boxed())
    }

    async fn history(&self) -> Vec<String> {
        self.history.lock().await.clone()
    }

    async fn push_history(&self, _is_response: bool, content: &str) {
        self.history.lock().await.push(content.to_string());
    }

    async fn reset_history(&self) {
        self.history.lock().await.clear();
    }
}

/// Extraction mock: returns a fixed record (or failure) and records inputs.
struct MockExtraction {
    info: Option<ChatInfo>,
    fail: bool,
    requests: Arc<StdMutex<Vec<String>>>,
}

impl MockExtraction {
    fn returning(info: Option<ChatInfo>) -> Self {
        Self {
            info,
            fail: false,
            requests: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn failing() -> Self {
        Self {
            info: None,
            fail: true,
            requests: Arc::new(StdMutex::new(Vec::new())),
        }
    }

}

#[async_trait]
impl ExtractionBackend for MockExtraction {
    async fn extract(&self, text: &str) -> Result<Option<ChatInfo>, LlmError> {
        self.requests.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(LlmError::Api("extraction unavailable".to_string()));
        }
        Ok(self.info.clone())
    }
}

/// Completion mock whose single fragment is held back until the gate is
/// released, keeping a turn in flight for as long as a test needs.
struct GatedCompletion {
    gate: Arc<Notify>,
}

#[async_trait]
impl CompletionBackend for GatedCompletion {
    async fn stream_chat(
        &self,
        _utterance: &str,
        _keep_history: bool,
    ) -> Result<FragmentStream, LlmError> {
        let gate = self.gate.clone();
        Ok(futures_util::stream::once(async move {
            gate.notified().await;
            Ok(Some("ok".to_string()))
        })
        .boxed())
    }

    async fn history(&self) -> Vec<String> {
        Vec::new()
    }

    async fn push_history(&self, _is_response: bool, _content: &str) {}

    async fn reset_history(&self) {}
}

fn titled(title: &str) -> ChatInfo {
    ChatInfo {
        title: Some(title.to_string()),
        summary: None,
        tags: None,
    }
}

#[tokio::test]
async fn first_turn_appends_user_item_and_stamps_defaults() {
    let base = temp_base();
    let opts = options(base.clone());
    let expected_config = opts.last_used_configuration_id;
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("Hi"), None, Some(" there")]),
        MockExtraction::returning(None),
        opts,
    );
    let mut conversation = Conversation::new();

    let mut seen: Vec<String> = Vec::new();
    let mut on_fragment = |s: &str| seen.push(s.to_string());
    let response = coordinator
        .execute_turn("hello", &mut conversation, Some(&mut on_fragment))
        .await
        .expect("turn");

    assert_eq!(response, "Hi there");
    // None fragments are dropped, not forwarded.
    assert_eq!(seen, vec!["Hi", " there"]);

    assert_eq!(conversation.items.len(), 1);
    assert!(!conversation.items[0].is_response);
    assert_eq!(conversation.items[0].markdown_content, "hello");
    assert!(conversation.items[0].first_response_duration.is_none());
    assert!(conversation.items[0].complete_process_duration.is_none());
    assert_eq!(conversation.model, "llama3.2:latest");
    assert_eq!(conversation.configuration_id, expected_config);
    assert_eq!(coordinator.phase(), TurnPhase::Idle);

    // Persisted on the same turn.
    let saved = base.join(format!("{}.json", conversation.id));
    assert!(saved.exists());
}

#[tokio::test]
async fn later_turns_do_not_overwrite_session_stamp() {
    let base = temp_base();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("ok")]),
        MockExtraction::returning(None),
        options(base),
    );
    let mut conversation = Conversation::new();

    coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect("turn 1");
    conversation.model = "pinned-model".to_string();
    conversation.push_item(ConversationItem::response("hi"));

    coordinator
        .execute_turn("follow-up", &mut conversation, None)
        .await
        .expect("turn 2");
    assert_eq!(conversation.model, "pinned-model");

    // The item crossing the two-item threshold carries both durations.
    let third = &conversation.items[2];
    assert!(third.first_response_duration.is_some());
    assert!(third.complete_process_duration.is_some());
}

#[tokio::test]
async fn pending_reset_is_consumed_by_exactly_one_turn() {
    let completion = MockCompletion::new(&[Some("ok")]);
    let calls = completion.keep_history_calls.clone();
    let coordinator = TurnCoordinator::new(
        completion,
        MockExtraction::returning(None),
        options(temp_base()),
    );
    let mut conversation = Conversation::new();

    coordinator.request_history_reset();
    coordinator
        .execute_turn("one", &mut conversation, None)
        .await
        .expect("turn 1");
    coordinator
        .execute_turn("two", &mut conversation, None)
        .await
        .expect("turn 2");
    coordinator
        .execute_turn("three", &mut conversation, None)
        .await
        .expect("turn 3");

    assert_eq!(calls.lock().unwrap().clone(), vec![false, true, true]);
}

#[tokio::test]
async fn pending_reset_is_spent_even_when_the_stream_fails() {
    let completion = MockCompletion::new(&[Some("ok")]);
    let calls = completion.keep_history_calls.clone();
    completion.fail_next_stream();
    let coordinator = TurnCoordinator::new(
        completion,
        MockExtraction::returning(None),
        options(temp_base()),
    );
    let mut conversation = Conversation::new();

    coordinator.request_history_reset();
    coordinator
        .execute_turn("one", &mut conversation, None)
        .await
        .expect_err("turn 1 fails");
    coordinator
        .execute_turn("two", &mut conversation, None)
        .await
        .expect("turn 2");

    // The failed turn consumed the flag; the next one keeps history.
    assert_eq!(calls.lock().unwrap().clone(), vec![false, true]);
}

#[tokio::test]
async fn overlapping_turn_is_rejected_while_one_is_in_flight() {
    let gate = Arc::new(Notify::new());
    let coordinator = Arc::new(TurnCoordinator::new(
        GatedCompletion { gate: gate.clone() },
        MockExtraction::returning(None),
        options(temp_base()),
    ));

    let held = coordinator.clone();
    let first = tokio::spawn(async move {
        let mut conversation = Conversation::new();
        held.execute_turn("one", &mut conversation, None).await
    });

    // Wait until the first turn is parked on its stream.
    for _ in 0..100 {
        if coordinator.phase() == TurnPhase::Streaming {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(coordinator.phase(), TurnPhase::Streaming);

    let mut conversation = Conversation::new();
    let err = coordinator
        .execute_turn("two", &mut conversation, None)
        .await
        .expect_err("second turn must be rejected");
    assert!(matches!(err, TurnError::Busy));
    // The rejected call leaves the conversation untouched.
    assert!(conversation.items.is_empty());

    gate.notify_one();
    first.await.expect("join").expect("held turn completes");
    assert_eq!(coordinator.phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn mid_stream_failure_keeps_utterance_and_error_identity() {
    let completion = MockCompletion::new(&[Some("par")]);
    completion.fail_next_stream();
    let coordinator = TurnCoordinator::new(
        completion,
        MockExtraction::returning(Some(titled("ignored"))),
        options(temp_base()),
    );
    let mut conversation = Conversation::new();

    let err = coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect_err("turn must fail");

    match err {
        TurnError::Llm(LlmError::Api(msg)) => assert_eq!(msg, "stream interrupted"),
        other => panic!("unexpected error: {:?}", other),
    }
    // The user's utterance stays recorded.
    assert_eq!(conversation.items.len(), 1);
    assert_eq!(conversation.items[0].markdown_content, "hello");
    // Extraction never ran and nothing merged.
    assert_ne!(conversation.title, "ignored");
    assert_eq!(coordinator.phase(), TurnPhase::Failed);

    // The coordinator recovers for the next turn.
    coordinator
        .execute_turn("again", &mut conversation, None)
        .await
        .expect("turn after failure");
    assert_eq!(coordinator.phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn extraction_none_keeps_metadata_but_still_saves() {
    let base = temp_base();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("ok")]),
        MockExtraction::returning(None),
        options(base.clone()),
    );
    let mut conversation = Conversation::new();
    conversation.title = "Untitled".to_string();

    coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect("turn");

    assert_eq!(conversation.title, "Untitled");
    assert!(conversation.summary.is_none());
    assert!(base.join(format!("{}.json", conversation.id)).exists());
}

#[tokio::test]
async fn extraction_record_is_merged_and_persisted() {
    let base = temp_base();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("ok")]),
        MockExtraction::returning(Some(titled("Named by the model"))),
        options(base.clone()),
    );
    let mut conversation = Conversation::new();

    coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect("turn");

    assert_eq!(conversation.title, "Named by the model");

    let saved = std::fs::read_to_string(base.join(format!("{}.json", conversation.id)))
        .expect("saved file");
    let on_disk: Conversation = serde_json::from_str(&saved).expect("parse");
    assert_eq!(on_disk.title, "Named by the model");
}

#[tokio::test]
async fn extraction_request_joins_transcript_and_utterance() {
    let extraction = MockExtraction::returning(None);
    let requests = extraction.requests.clone();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("ok")]),
        extraction,
        options(temp_base()),
    );
    let mut conversation = Conversation::new();
    conversation.push_item(ConversationItem::user("earlier question"));
    conversation.push_item(ConversationItem::response("earlier answer"));

    coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect("turn");

    let seen = requests.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec!["earlier question\nearlier answer\nhello\nhello".to_string()]
    );
}

#[tokio::test]
async fn refresh_metadata_reports_and_never_persists() {
    let base = temp_base();
    let completion = MockCompletion::new(&[]);
    completion.push_history(false, "q").await;
    completion.push_history(true, "a").await;
    let extraction = MockExtraction::returning(Some(titled("Refreshed title")));
    let requests = extraction.requests.clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator =
        TurnCoordinator::new(completion, extraction, options(base.clone())).with_notifications(tx);
    let mut conversation = Conversation::new();

    coordinator.refresh_metadata(&mut conversation).await;

    assert_eq!(conversation.title, "Refreshed title");
    match rx.try_recv().expect("notice") {
        MetadataNotice::Refreshed(info) => {
            assert_eq!(info.title.as_deref(), Some("Refreshed title"))
        }
        MetadataNotice::Failed(e) => panic!("unexpected failure notice: {}", e),
    }
    // Input is the standing history, not a per-turn join.
    assert_eq!(requests.lock().unwrap().clone(), vec!["q\na".to_string()]);
    // Nothing written.
    assert!(!base.exists());
}

#[tokio::test]
async fn refresh_metadata_failure_is_reported_not_raised() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[]),
        MockExtraction::failing(),
        options(temp_base()),
    )
    .with_notifications(tx);
    let mut conversation = Conversation::new();
    conversation.title = "Kept".to_string();

    coordinator.refresh_metadata(&mut conversation).await;

    assert_eq!(conversation.title, "Kept");
    match rx.try_recv().expect("notice") {
        MetadataNotice::Failed(LlmError::Api(msg)) => {
            assert_eq!(msg, "extraction unavailable")
        }
        other => panic!("unexpected notice: {:?}", other),
    }
}

#[tokio::test]
async fn response_item_saved_by_caller_survives_resume() {
    let base = temp_base();
    let coordinator = TurnCoordinator::new(
        MockCompletion::new(&[Some("Hi"), Some(" there")]),
        MockExtraction::returning(None),
        options(base.clone()),
    );
    let mut conversation = Conversation::new();

    let response = coordinator
        .execute_turn("hello", &mut conversation, None)
        .await
        .expect("turn");
    conversation.push_item(ConversationItem::response(response));
    coordinator
        .save_conversation(&conversation)
        .await
        .expect("save");

    // The transcript on disk matches the in-memory one, response included.
    let on_disk = std::fs::read_to_string(base.join(format!("{}.json", conversation.id)))
        .expect("saved file");
    let on_disk: Conversation = serde_json::from_str(&on_disk).expect("parse");
    assert_eq!(on_disk.items.len(), 2);
    assert!(on_disk.items[1].is_response);
    assert_eq!(on_disk.items[1].markdown_content, "Hi there");
}

#[tokio::test]
async fn load_conversation_replays_history_and_rebinds_store() {
    let base = temp_base();
    let mut saved = Conversation::new();
    saved.title = "Resumed".to_string();
    saved.push_item(ConversationItem::user("old question"));
    saved.push_item(ConversationItem::response("old answer"));
    ConversationFile::create(&saved, &base)
        .save(&saved)
        .await
        .expect("seed save");

    let completion = MockCompletion::new(&[Some("ok")]);
    completion.push_history(false, "stale").await;
    let history = completion.history.clone();
    let coordinator = TurnCoordinator::new(
        completion,
        MockExtraction::returning(None),
        options(base.clone()),
    );

    let mut conversation = coordinator
        .load_conversation(&format!("{}.json", saved.id))
        .await
        .expect("load");
    assert_eq!(conversation.title, "Resumed");
    assert_eq!(conversation.items.len(), 2);
    // Stale history is replaced by the loaded transcript.
    assert_eq!(
        history.lock().await.clone(),
        vec!["old question", "old answer"]
    );

    // Continuing the conversation reuses the loaded file.
    coordinator
        .execute_turn("new question", &mut conversation, None)
        .await
        .expect("turn");
    let on_disk = std::fs::read_to_string(base.join(format!("{}.json", saved.id)))
        .expect("saved file");
    let on_disk: Conversation = serde_json::from_str(&on_disk).expect("parse");
    assert_eq!(on_disk.items.len(), 3);
    assert_eq!(on_disk.items[2].markdown_content, "new question");
}
