//! Error types for backfill-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for backfill-core
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream record store could not be read
    #[error("Source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    /// A record references an entity that does not exist
    #[error("Data integrity error: {0}")]
    DataIntegrity(#[from] IntegrityError),

    /// Downstream event stream rejected or could not be reached
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was stopped by an external signal
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::SourceUnavailable(err) => Some(err.remediation()),
            Self::DataIntegrity(err) => Some(err.remediation()),
            Self::Publish(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Check sink directory", "ls -ld \"$(dirname <sink-path>)\"")
                    .alternative("Verify the sink directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A record could not be serialized. Inspect the offending payload.")
                    .command(
                        "Show payload",
                        "sqlite3 <db-path> 'SELECT payload FROM records WHERE id = <record-id>'",
                    )
                    .alternative("Resume past the record with --resume-after <record-id>."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new(
                    "The run was stopped at a page boundary. Rerun to continue; already published records are safe to replay.",
                )
                .command("Resume", "backfill run --resume-after <last-published-id>")
                .alternative("Rerun without --resume-after to replay the whole window."),
            ),
        }
    }

    /// Whether an operator rerun is a sensible response to this error.
    ///
    /// Publishing is at-least-once, so a rerun only replays records the
    /// downstream consumer already treats as idempotent.
    #[must_use]
    pub fn is_retryable_by_rerun(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::Publish(_) | Self::Cancelled(_) | Self::Io(_)
        )
    }
}

/// Upstream record store errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open record store {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record {record_id}: {reason}")]
    Corrupt { record_id: i64, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl SourceError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Open { path, .. } => Remediation::new(format!(
                "The record store could not be opened: {path}. Verify the path and permissions."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --db with the correct database path."),
            Self::Database(_) | Self::Backend(_) => Remediation::new(
                "The record store is unavailable. Rerun once it is reachable; the window is fixed so reruns are safe.",
            )
            .command("Integrity check", "sqlite3 <db-path> 'PRAGMA integrity_check'")
            .alternative("Resume from the last published record with --resume-after."),
            Self::Corrupt { record_id, .. } => Remediation::new(format!(
                "Record {record_id} has an unreadable payload. Repair or remove it, then rerun."
            ))
            .command(
                "Inspect record",
                format!("sqlite3 <db-path> 'SELECT payload FROM records WHERE id = {record_id}'"),
            )
            .alternative(format!("Resume past it with --resume-after {record_id}.")),
        }
    }
}

/// Enrichment integrity errors (dangling references)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("record {record_id} references missing container {container_id}")]
    DanglingContainer { record_id: i64, container_id: i64 },

    #[error("record {record_id} references missing group {group_id}")]
    DanglingGroup { record_id: i64, group_id: i64 },

    #[error("record {record_id} has no group")]
    MissingGroup { record_id: i64 },
}

impl IntegrityError {
    /// The record that carried the dangling reference.
    #[must_use]
    pub fn record_id(&self) -> i64 {
        match self {
            Self::DanglingContainer { record_id, .. }
            | Self::DanglingGroup { record_id, .. }
            | Self::MissingGroup { record_id } => *record_id,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        Remediation::new(format!(
            "Record {} points at an entity that no longer exists.",
            self.record_id()
        ))
        .command("Skip dangling records", "backfill run (without --strict)")
        .alternative("Restore the missing container or group rows before rerunning.")
    }
}

/// Downstream event stream errors
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("record {record_id} rejected: {reason}")]
    Rejected { record_id: i64, reason: String },

    #[error("event stream unreachable: {0}")]
    Unreachable(String),

    #[error("frame of {len} bytes exceeds the u32 length prefix")]
    FrameTooLarge { len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Rejected { record_id, .. } => Remediation::new(format!(
                "The event stream rejected record {record_id}. Fix the record or the consumer and rerun."
            ))
            .command("Resume", format!("backfill run --resume-after {record_id}"))
            .alternative("Rerun the whole window; publishes are safe to repeat."),
            Self::Unreachable(_) | Self::Io(_) => Remediation::new(
                "The event stream could not be written. Restore it and rerun; publishes are safe to repeat.",
            )
            .command("Inspect sink", "backfill inspect <sink-path>")
            .alternative("Resume from the last published record with --resume-after."),
            Self::FrameTooLarge { .. } | Self::Encode(_) => Remediation::new(
                "A record could not be encoded for the event stream.",
            )
            .command("Inspect sink", "backfill inspect <sink-path>")
            .alternative("Exclude the oversized record and resume after it."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show config", "cat backfill.toml")
                .alternative("Validate the TOML syntax."),
            Self::InvalidEnv { var, .. } => Remediation::new(format!(
                "{var} could not be parsed. Switches take 1/0, true/false, yes/no or on/off; day counts take an integer."
            ))
            .command("Show value", format!("echo ${var}"))
            .alternative(format!("Unset {var} to use the configured value.")),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "cat backfill.toml")
                    .alternative("Review validation errors and adjust backfill.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
