//! Engine configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/revline/config.toml` (falling back to
//! `~/.config/revline/config.toml`). Every scoring constant and matching
//! threshold is a tunable, not code; a missing or unparsable file falls
//! back to the built-in defaults — config errors are soft failures.

use serde::Deserialize;
use tracing::warn;

use crate::anchor::AnchorConfig;
use crate::scoring::ScoringConfig;

/// Operational limits for the engine itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on one re-anchor pass, in milliseconds. Exceeding it
    /// fails the ingestion with a retryable timeout instead of blocking
    /// the change indefinitely.
    pub reanchor_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { reanchor_timeout_ms: 5_000 }
    }
}

/// Full engine configuration: anchor matching, scoring rules, and limits.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub anchor: AnchorConfig,
    pub scoring: ScoringConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Parses a TOML document; unknown keys are ignored, missing sections
    /// take their defaults.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Loads the config file at `path`, falling back to defaults when the
    /// file is absent or unparsable. Never fails.
    pub fn load(path: &std::path::Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };
        match Self::from_toml(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable config");
                Self::default()
            }
        }
    }
}

/// Returns the path to the revline config file.
///
/// Prefers `$XDG_CONFIG_HOME/revline/config.toml`; falls back to
/// `~/.config/revline/config.toml` when the env var is absent.
pub fn config_path() -> std::path::PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| std::path::PathBuf::from(h).join(".config"))
        })
        .unwrap_or_else(|| std::path::PathBuf::from(".config"));
    base.join("revline").join("config.toml")
}
