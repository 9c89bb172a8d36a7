//! Error types for nodestats-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to diagnose the issue
    pub commands: Vec<(String, String)>,
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

    /// Add a labelled command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
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
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
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

/// Main error type for nodestats-core
#[derive(Error, Debug)]
pub enum Error {
    /// Settings errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A resource guard rejected an allocation
    #[error("Circuit breaking: {0}")]
    Breaker(#[from] CircuitBreakingError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime errors (sweeper thread, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Breaker(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the settings file exists and is readable."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the stats service or retry the command.")
                    .alternative("Run with RUST_LOG=nodestats_core=debug for details."),
            ),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push_str("\n\n");
        output.push_str(&remediation.render_plain());
    }
    output
}

/// Settings parsing and loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Settings file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\"")),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read settings file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => {
                Remediation::new(
                    "Settings parse failed. Fix the TOML syntax or the `key=value` override and retry.",
                )
                .command("Show effective settings", "nodestats settings --config <file>")
            }
            Self::InvalidValue { key, .. } => Remediation::new(format!(
                "Setting `{key}` was rejected; its previous value is still in effect."
            ))
            .alternative("Sizes and durations must be non-negative, e.g. `500`, `10s`, `64mb`, `5%`."),
        }
    }
}

/// Raised when an allocation estimate would push a breaker over its limit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CircuitBreakingError {
    /// Name of the breaker that tripped
    pub breaker: String,
    /// Bytes requested by the rejected allocation
    pub requested: u64,
    /// Configured limit of the breaker
    pub limit: u64,
    /// Deterministic trip message
    pub message: String,
}

impl CircuitBreakingError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        Remediation::new(format!(
            "Reduce the size of the request or raise the `{}` breaker limit.",
            self.breaker
        ))
        .command("Show breaker limits", "nodestats breakers")
    }
}
