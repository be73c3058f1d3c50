//! Structured metadata extracted from a transcript (title, summary, tags)
//! and its non-destructive merge into a conversation.

use crate::conversation::Conversation;
use serde::{Deserialize, Serialize};

/// Metadata record produced by the extraction backend.
///
/// Every field is optional: the model may be confident about a title but not
/// a summary. Absent fields never overwrite conversation state on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl ChatInfo {
    /// Merge into `conversation`, overwriting only fields present here.
    pub fn merge(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(summary) = &self.summary {
            conversation.summary = Some(summary.clone());
        }
        if let Some(tags) = &self.tags {
            conversation.tags = tags.clone();
        }
    }

    /// True when no field carries a value.
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.summary.is_none() && self.tags.is_none()
    }
}
