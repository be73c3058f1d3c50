//! Conversation persistence: one JSON file per conversation under a base
//! directory, named by the conversation id.

use crate::conversation::Conversation;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation record invalid: {0}")]
    Format(#[from] serde_json::Error),
}

/// Persistence handle for a single conversation file.
#[derive(Debug, Clone)]
pub struct ConversationFile {
    conversation_id: Uuid,
    path: PathBuf,
}

impl ConversationFile {
    /// Bind a handle for `conversation` under `base_path`
    /// (`<base_path>/<id>.json`). Nothing is written until `save`.
    pub fn create(conversation: &Conversation, base_path: &Path) -> Self {
        Self {
            conversation_id: conversation.id,
            path: base_path.join(format!("{}.json", conversation.id)),
        }
    }

    /// Load a conversation from `<base_path>/<filename>` and return the
    /// handle bound to that file alongside the record.
    pub async fn load(
        base_path: &Path,
        filename: &str,
    ) -> Result<(Self, Conversation), StoreError> {
        let path = base_path.join(filename);
        let s = tokio::fs::read_to_string(&path).await?;
        let conversation: Conversation = serde_json::from_str(&s)?;
        Ok((
            Self {
                conversation_id: conversation.id,
                path,
            },
            conversation,
        ))
    }

    /// Write the conversation as pretty JSON, creating the base directory
    /// on first save.
    pub async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&self.path, json).await?;
        log::debug!("saved conversation {} to {}", conversation.id, self.path.display());
        Ok(())
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

/// List saved conversations under `base_path` (most code only needs id and
/// title, but the full records are cheap at this scale). Unreadable or
/// non-JSON entries are skipped with a warning.
pub async fn list_conversations(base_path: &Path) -> Result<Vec<Conversation>, StoreError> {
    let mut out = Vec::new();
    let mut dir = match tokio::fs::read_dir(base_path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => match serde_json::from_str::<Conversation>(&s) {
                Ok(c) => out.push(c),
                Err(e) => log::warn!("skipping invalid conversation {}: {}", path.display(), e),
            },
            Err(e) => log::warn!("skipping unreadable conversation {}: {}", path.display(), e),
        }
    }
    out.sort_by(|a, b| b.date_last_edited.cmp(&a.date_last_edited));
    Ok(out)
}
