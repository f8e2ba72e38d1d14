//! Error types for recordfill.
//!
//! Library crates use [`RecordfillError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Two outcomes of the resolution pipeline are deliberately *not* errors:
//! an extraction pass that matches nothing returns an empty candidate list,
//! and a candidate refused by the validator yields a `Rejection` that is
//! logged and dropped.

use std::path::PathBuf;

/// Top-level error type for all recordfill operations.
#[derive(Debug, thiserror::Error)]
pub enum RecordfillError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A source client failed: network error, timeout, non-2xx, or an unreadable body.
    #[error("source {source_name} unavailable: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    /// HTML or JSON payload could not be parsed.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The LLM answered with something that is not the JSON object we asked for.
    #[error("malformed LLM response: {0}")]
    MalformedLlmResponse(String),

    /// Postal cache actor or cache file error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Input/output table (CSV) error.
    #[error("table error: {0}")]
    Table(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad config value, malformed header, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unexpected failure while resolving one record. Caught at the record boundary.
    #[error("record failed: {0}")]
    RecordFatal(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RecordfillError>;

impl RecordfillError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a source-unavailable error for the named source.
    pub fn source(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a transient source failure worth one retry.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}
