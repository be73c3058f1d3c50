//! Ollama API client (http://127.0.0.1:11434 by default).
//! Streaming chat over NDJSON plus structured (JSON-format) extraction.

use crate::llm::{CompletionBackend, ExtractionBackend, FragmentStream, LlmError};
use crate::metadata::ChatInfo;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

const EXTRACTION_PROMPT: &str = "Derive metadata for the following chat transcript. \
Respond with a JSON object with the optional string fields \"title\" and \"summary\" \
and an optional string array field \"tags\". Omit any field you cannot derive \
reliably from the transcript.\n\nTranscript:\n";

/// Client for the Ollama HTTP API, bound to one model.
///
/// Holds the standing chat history for completion requests; a second
/// instance with its own model typically serves metadata extraction.
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl OllamaBackend {
    pub fn new(base_url: Option<String>, model: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            model: model.into(),
            client: reqwest::Client::new(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// GET /api/tags — list available models.
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>, LlmError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        let data: TagsResponse = res.json().await?;
        Ok(data.models.unwrap_or_default())
    }

    async fn send_chat(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
        format: Option<&str>,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages,
            stream,
            format: format.map(String::from),
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        Ok(res)
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    async fn stream_chat(
        &self,
        utterance: &str,
        keep_history: bool,
    ) -> Result<FragmentStream, LlmError> {
        let messages = {
            let mut history = self.history.lock().await;
            if !keep_history {
                log::debug!("ollama: dropping chat history before send");
                history.clear();
            }
            history.push(ChatMessage::user(utterance));
            history.clone()
        };

        let res = self.send_chat(messages, true, None).await?;

        let (tx, rx) = mpsc::unbounded_channel::<Result<Option<String>, LlmError>>();
        let history = self.history.clone();
        tokio::spawn(async move {
            let mut stream = res.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut content = String::new();
            'pump: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Request(e)));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                    buffer.drain(..1);
                    let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let event: ChatStreamEvent = match serde_json::from_str(&line) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };
                    if let Some(msg) = event.message {
                        if msg.content.is_empty() {
                            // Keep-alive / terminal chunk without content.
                            let _ = tx.send(Ok(None));
                        } else {
                            content.push_str(&msg.content);
                            let _ = tx.send(Ok(Some(msg.content)));
                        }
                    }
                    if event.done {
                        break 'pump;
                    }
                }
            }
            history.lock().await.push(ChatMessage::assistant(content));
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .await
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }

    async fn push_history(&self, is_response: bool, content: &str) {
        let msg = if is_response {
            ChatMessage::assistant(content)
        } else {
            ChatMessage::user(content)
        };
        self.history.lock().await.push(msg);
    }

    async fn reset_history(&self) {
        self.history.lock().await.clear();
    }
}

#[async_trait]
impl ExtractionBackend for OllamaBackend {
    async fn extract(&self, text: &str) -> Result<Option<ChatInfo>, LlmError> {
        let prompt = format!("{}{}", EXTRACTION_PROMPT, text);
        let res = self
            .send_chat(vec![ChatMessage::user(prompt)], false, Some("json"))
            .await?;
        let data: ChatResponse = res.json().await?;
        let content = data
            .message
            .map(|m| m.content)
            .unwrap_or_default();
        Ok(parse_chat_info(&content))
    }
}

/// Parse model output into a metadata record. Unparseable or empty output
/// means the extraction was inconclusive, not that it failed.
fn parse_chat_info(content: &str) -> Option<ChatInfo> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatInfo>(trimmed) {
        Ok(info) if !info.is_empty() => Some(info),
        Ok(_) => None,
        Err(e) => {
            log::debug!("ollama: unparseable extraction output: {}", e);
            None
        }
    }
}

/// One message in an Ollama chat request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<OllamaModel>>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}
