//! TOML configuration parsing and validation.
//!
//! Every command reads one file (default `./config/fbx.toml`). Only
//! `[db]` is required; the other sections fall back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/feedback.sqlite"
//!
//! [dedup]
//! similarity_threshold = 0.8
//! max_opportunities_per_input = 3
//! lock_timeout_ms = 5000
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use feedback_harness_core::dedup::DEFAULT_SIMILARITY_THRESHOLD;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Minimum similarity for a merge, in `(0, 1]`.
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
    /// Candidates kept per content item; extras are dropped with a warning.
    #[serde(default = "default_max_per_input")]
    pub max_opportunities_per_input: u32,
    /// Bounded wait for the single-writer lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
            max_opportunities_per_input: default_max_per_input(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl DedupConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}
fn default_max_per_input() -> u32 {
    3
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let threshold = config.dedup.similarity_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!(
            "dedup.similarity_threshold must be in (0.0, 1.0], got {}",
            threshold
        );
    }

    if config.dedup.max_opportunities_per_input == 0 {
        anyhow::bail!("dedup.max_opportunities_per_input must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"/tmp/fb.sqlite\"\n").unwrap();
        assert_eq!(cfg.dedup.similarity_threshold, 0.8);
        assert_eq!(cfg.dedup.max_opportunities_per_input, 3);
        assert_eq!(cfg.dedup.lock_timeout(), Duration::from_secs(5));
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.server.bind, "127.0.0.1:7341");
    }

    #[test]
    fn test_threshold_range_enforced() {
        for bad in ["0.0", "1.5", "-0.2"] {
            let text = format!(
                "[db]\npath = \"x\"\n[dedup]\nsimilarity_threshold = {}\n",
                bad
            );
            assert!(parse_config(&text).is_err(), "accepted {}", bad);
        }
        let ok = "[db]\npath = \"x\"\n[dedup]\nsimilarity_threshold = 1.0\n";
        assert!(parse_config(ok).is_ok());
    }

    #[test]
    fn test_remote_provider_requires_model_and_dims() {
        let text = "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n";
        let err = parse_config(text).unwrap_err().to_string();
        assert!(err.contains("embedding.model"), "{}", err);

        let text = "[db]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\n";
        let err = parse_config(text).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"), "{}", err);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let text = "[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n";
        assert!(parse_config(text).is_err());
    }
}
