//! Configuration loader for Companion.
//!
//! Reads `config.toml` from the data directory (`~/.companion/` in production)
//! and deserializes it into [`CompanionConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use companion_types::config::{CompanionConfig, LlmConfig};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "COMPANION_DATA_DIR";

/// Environment variable consulted when `[llm].api_key` is not set.
pub const LLM_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Resolve the data directory: `COMPANION_DATA_DIR`, else `~/.companion`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".companion")
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`CompanionConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> CompanionConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return CompanionConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return CompanionConfig::default();
        }
    };

    match toml::from_str::<CompanionConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            CompanionConfig::default()
        }
    }
}

/// API key for the chat-completion client: config value first, then
/// `OPENAI_API_KEY`. Blank values count as unset.
pub fn resolve_llm_api_key(config: &LlmConfig) -> Option<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var(LLM_API_KEY_ENV).ok())
        .filter(|k| !k.trim().is_empty())
}
