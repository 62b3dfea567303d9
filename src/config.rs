//! Configuration parsing and validation.
//!
//! Groundwork is configured via a TOML file (default `config/gw.toml`).
//! Every section except `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/gw.sqlite"
//! ```
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[db]` | SQLite database path |
//! | `[chunking]` | Maximum segment length in characters |
//! | `[retrieval]` | Default number of evidence segments |
//! | `[grounding]` | Overlap threshold for citation verification |
//! | `[generation]` | Generation backend selection, model, timeouts |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use groundwork_core::retrieve::DEFAULT_TOP_K;
use groundwork_core::segment::DEFAULT_MAX_CHARS;
use groundwork_core::verify::DEFAULT_OVERLAP_THRESHOLD;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> i64 {
    DEFAULT_TOP_K
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroundingConfig {
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f64,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: default_overlap_threshold(),
        }
    }
}

fn default_overlap_threshold() -> f64 {
    DEFAULT_OVERLAP_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` or `"fixed"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// JSON file with the claims returned by the `fixed` provider.
    #[serde(default)]
    pub fixed_claims_path: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            fixed_claims_path: None,
        }
    }
}

fn default_provider() -> String {
    "fixed".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Defaults for everything, with the database at `path`.
    pub fn minimal(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            grounding: GroundingConfig::default(),
            generation: GenerationConfig::default(),
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.grounding.overlap_threshold) {
            bail!("grounding.overlap_threshold must be in [0.0, 1.0]");
        }
        if self.generation.timeout_secs == 0 {
            bail!("generation.timeout_secs must be > 0");
        }
        match self.generation.provider.as_str() {
            "openai" | "fixed" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be openai or fixed.",
                other
            ),
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_file() {
        let config: Config = toml::from_str("[db]\npath = \"data/gw.sqlite\"\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_chars, 500);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.grounding.overlap_threshold, 0.3);
        assert_eq!(config.generation.provider, "fixed");
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let config: Config =
            toml::from_str("[db]\npath = \"x\"\n[grounding]\noverlap_threshold = 1.5\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config: Config =
            toml::from_str("[db]\npath = \"x\"\n[generation]\nprovider = \"magic\"\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Unknown generation provider"));
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let mut config = Config::minimal("x");
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());
    }
}
