// ⚙️ Configuration - where the database lives and how merges run
//
// Read from a JSON file (default `waterfall.json`) when one exists, then
// overridden by environment variables. Every field has a default, so an
// empty file or no file at all is a valid configuration.

use crate::merge::MergeOptions;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "waterfall.json";

pub const ENV_DATABASE: &str = "WATERFALL_DB";
pub const ENV_LOG: &str = "WATERFALL_LOG";
pub const ENV_ADDR: &str = "WATERFALL_ADDR";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// timestamp LEVEL target - message
    #[default]
    Compact,
    /// JSON lines
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub server_addr: String,
    pub merge: MergeOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: PathBuf::from("waterfall.db"),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            server_addr: "0.0.0.0:3000".to_string(),
            merge: MergeOptions::default(),
        }
    }
}

impl Config {
    /// Load `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// `load`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DATABASE) {
            self.database = PathBuf::from(db);
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log_level = level;
        }
        if let Some(addr) = lookup(ENV_ADDR) {
            self.server_addr = addr;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
