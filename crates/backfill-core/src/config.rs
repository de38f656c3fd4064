//! Configuration for backfill
//!
//! Loaded from TOML. Every field has a serde default so a partial (or empty)
//! file is valid. Two environment variables override the file:
//!
//! - `BACKFILL_SKIP`: skip switch (`1/0`, `true/false`, `yes/no`, `on/off`;
//!   empty means off)
//! - `BACKFILL_RETENTION_DAYS`: retention in days (integer)
//!
//! Overrides go through an injected lookup so the pipeline itself never
//! reads the process environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::model::DEFAULT_PAGE_SIZE;

pub const ENV_SKIP: &str = "BACKFILL_SKIP";
pub const ENV_RETENTION_DAYS: &str = "BACKFILL_RETENTION_DAYS";

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Run behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Skip switch: when set the run ends immediately as skipped.
    #[serde(default)]
    pub skip: bool,

    /// Retention in days. Unset, zero and negative all mean 90.
    #[serde(default)]
    pub retention_days: Option<i64>,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Abort on dangling references instead of skipping the record.
    #[serde(default)]
    pub strict_integrity: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            skip: false,
            retention_days: None,
            page_size: default_page_size(),
            strict_integrity: false,
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Upstream record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("records.db")
}

/// Where inserts are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    AppendLog,
    Stdout,
}

/// Downstream event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Append-log path (ignored for stdout).
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,

    /// fsync the log at every page boundary.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            path: default_sink_path(),
            fsync: true,
        }
    }
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("backfill-stream.log")
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration without validating it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Apply `BACKFILL_*` overrides from `lookup`.
    ///
    /// Unset variables leave the file value alone.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_SKIP) {
            self.backfill.skip = parse_switch(ENV_SKIP, &value)?;
        }
        if let Some(value) = lookup(ENV_RETENTION_DAYS) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                let days = trimmed.parse::<i64>().map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_RETENTION_DAYS.to_string(),
                    value: value.clone(),
                })?;
                self.backfill.retention_days = Some(days);
            }
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|var| std::env::var(var).ok())
    }

    /// Check field bounds.
    pub fn validate(&self) -> Result<()> {
        let page_size = self.backfill.page_size;
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConfigError::ValidationError(format!(
                "backfill.page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            ))
            .into());
        }
        if self.source.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError("source.db_path is empty".to_string()).into());
        }
        if self.sink.kind == SinkKind::AppendLog && self.sink.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "sink.path is required for the append_log sink".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Parse an operator on/off switch.
pub fn parse_switch(var: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}
