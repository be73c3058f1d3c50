//! Initialize the configuration directory: create ~/.parley, a default
//! config file, and the conversations directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `conversations` subdirectory if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let conversations = config_dir.join("conversations");
    if !conversations.exists() {
        std::fs::create_dir_all(&conversations).with_context(|| {
            format!(
                "creating conversations directory {}",
                conversations.display()
            )
        })?;
        log::info!(
            "created conversations directory at {}",
            conversations.display()
        );
    }

    Ok(config_dir.to_path_buf())
}
