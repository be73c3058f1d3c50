//! Conversation transcript: ordered user/response items plus session metadata.
//!
//! The transcript is append-only while a session is live; title, summary, and
//! tags change only through a metadata merge (see `metadata`). Conversations
//! are persisted as JSON by `store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A persisted chat conversation: identity, metadata, and its transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub date_created: DateTime<Utc>,
    pub date_last_edited: DateTime<Utc>,
    /// Latency of the previous turn's first fragment; reset to zero at each
    /// turn start and stamped onto items by `push_item`.
    #[serde(default)]
    pub last_kick_off_time: Duration,
    /// Model the conversation was started with (stamped on the first turn).
    #[serde(default)]
    pub model: String,
    /// Personality/configuration the conversation was started with.
    #[serde(default = "Uuid::nil")]
    pub configuration_id: Uuid,
    #[serde(default)]
    pub items: Vec<ConversationItem>,
}

/// One transcript entry: either the user's utterance or the model's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationItem {
    pub is_response: bool,
    pub markdown_content: String,
    /// Set exactly once by `Conversation::push_item`, never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_response_duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_process_duration: Option<Duration>,
}

impl ConversationItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            is_response: false,
            markdown_content: content.into(),
            first_response_duration: None,
            complete_process_duration: None,
        }
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self {
            is_response: true,
            markdown_content: content.into(),
            first_response_duration: None,
            complete_process_duration: None,
        }
    }
}

impl Conversation {
    /// New empty conversation with a date-stamped default title.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: Self::default_title(),
            summary: None,
            tags: Vec::new(),
            date_created: now,
            date_last_edited: now,
            last_kick_off_time: Duration::ZERO,
            model: String::new(),
            configuration_id: Uuid::nil(),
            items: Vec::new(),
        }
    }

    /// Default title for conversations that have not been named yet.
    pub fn default_title() -> String {
        format!("Chat from {}", Utc::now().format("%Y-%m-%d %H:%M"))
    }

    /// Append an item to the transcript and run duration bookkeeping.
    ///
    /// With fewer than two items no durations are ever set: a single item
    /// gives no latency baseline. From the second item on, the item just
    /// appended gets the conversation's last kick-off time as its first
    /// response duration and `now - date_created` as its complete process
    /// duration, each set at most once. Note this attributes the *previous*
    /// turn's latency to the item that crossed the threshold, which matches
    /// the historical behavior this bookkeeping reproduces.
    pub fn push_item(&mut self, item: ConversationItem) {
        self.items.push(item);
        if self.items.len() < 2 {
            return;
        }
        let first_response = self.last_kick_off_time;
        let complete = (Utc::now() - self.date_created)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if let Some(added) = self.items.last_mut() {
            if added.first_response_duration.is_none() {
                added.first_response_duration = Some(first_response);
            }
            if added.complete_process_duration.is_none() {
                added.complete_process_duration = Some(complete);
            }
        }
    }

    /// All item contents joined with newlines (metadata extraction input).
    pub fn joined_content(&self) -> String {
        self.items
            .iter()
            .map(|i| i.markdown_content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_item_gets_no_durations() {
        let mut c = Conversation::new();
        c.push_item(ConversationItem::user("hello"));
        assert_eq!(c.items.len(), 1);
        assert!(c.items[0].first_response_duration.is_none());
        assert!(c.items[0].complete_process_duration.is_none());
    }

    #[test]
    fn second_item_gets_both_durations() {
        let mut c = Conversation::new();
        c.last_kick_off_time = Duration::from_millis(250);
        c.push_item(ConversationItem::user("hello"));
        c.push_item(ConversationItem::response("hi there"));
        let second = &c.items[1];
        assert_eq!(second.first_response_duration, Some(Duration::from_millis(250)));
        assert!(second.complete_process_duration.is_some());
        // The first item stays untouched.
        assert!(c.items[0].first_response_duration.is_none());
    }

    #[test]
    fn durations_are_set_only_once() {
        let mut c = Conversation::new();
        c.push_item(ConversationItem::user("one"));
        c.last_kick_off_time = Duration::from_secs(1);
        c.push_item(ConversationItem::user("two"));
        let stamped = c.items[1].first_response_duration;
        assert_eq!(stamped, Some(Duration::from_secs(1)));

        // Later appends stamp only themselves; earlier stamps never change.
        c.last_kick_off_time = Duration::from_secs(9);
        c.push_item(ConversationItem::user("three"));
        assert_eq!(c.items[1].first_response_duration, stamped);
        assert_eq!(
            c.items[2].first_response_duration,
            Some(Duration::from_secs(9))
        );
    }

    #[test]
    fn joined_content_uses_newlines() {
        let mut c = Conversation::new();
        c.push_item(ConversationItem::user("a"));
        c.push_item(ConversationItem::response("b"));
        assert_eq!(c.joined_content(), "a\nb");
    }
}
