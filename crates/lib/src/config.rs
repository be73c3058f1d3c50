//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`).
//! Missing file means defaults; every section is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default model for streamed chat completion.
pub const DEFAULT_CHAT_MODEL: &str = "llama3.2:latest";

/// Default model for metadata extraction (smaller is fine; the request is
/// a single structured call per turn).
pub const DEFAULT_EXTRACTION_MODEL: &str = "llama3.2:1b";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Conversation storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// LLM backend settings (Ollama endpoint and models).
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Session defaults stamped onto new conversations.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Where conversation files live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Base directory for conversation JSON files. Relative paths are
    /// resolved against the config file's parent. Default:
    /// `conversations` next to the config file.
    #[serde(default)]
    pub base_path: Option<PathBuf>,
}

/// Ollama endpoint and model selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendsConfig {
    /// Ollama base URL (default http://127.0.0.1:11434).
    pub base_url: Option<String>,
    /// Chat model: use the exact name from `ollama list` (e.g.
    /// "llama3.2:latest", "qwen3:8b").
    pub chat_model: Option<String>,
    /// Model used for metadata extraction; defaults separately from the
    /// chat model since a smaller one usually suffices.
    pub extraction_model: Option<String>,
}

/// Last-used session values; stamped onto a conversation on its first turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub last_used_model: Option<String>,
    pub last_used_configuration_id: Option<Uuid>,
}

/// Resolved per-session options handed to the turn coordinator.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub base_path: PathBuf,
    pub last_used_model: String,
    pub last_used_configuration_id: Uuid,
}

impl ChatOptions {
    /// Snapshot options from config, filling defaults.
    pub fn from_config(config: &Config, config_path: &Path) -> Self {
        Self {
            base_path: resolve_base_path(config, config_path),
            last_used_model: config
                .session
                .last_used_model
                .clone()
                .or_else(|| config.backends.chat_model.clone())
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            last_used_configuration_id: config
                .session
                .last_used_configuration_id
                .unwrap_or_else(Uuid::nil),
        }
    }
}

/// Resolve config path from env or default (~/.parley/config.json).
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parley").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or PARLEY_CONFIG_PATH). Missing file
/// => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the conversation base path: `storage.basePath` if set (relative
/// paths against the config file's parent), otherwise the default
/// `conversations` subdirectory next to the config file.
pub fn resolve_base_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.storage.base_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("conversations"),
    }
}

/// Chat model to use: config override or default.
pub fn resolve_chat_model(config: &Config) -> String {
    config
        .backends
        .chat_model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string())
}

/// Extraction model to use: config override or default.
pub fn resolve_extraction_model(config: &Config) -> String {
    config
        .backends
        .extraction_model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string())
}
