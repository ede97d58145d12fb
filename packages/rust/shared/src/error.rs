//! Error types for PatternLink.
//!
//! Library crates use [`PatternLinkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PatternLink operations.
#[derive(Debug, thiserror::Error)]
pub enum PatternLinkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Input document could not be parsed into text blocks.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Knowledge store load/flush error.
    #[error("knowledge store error: {0}")]
    Knowledge(String),

    /// Embedding model or projection error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Network/HTTP error talking to a remote model.
    #[error("network error: {0}")]
    Network(String),

    /// Oracle request or response error (never escapes the oracle adapter).
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (document without patterns, bad mapping, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PatternLinkError>;

impl PatternLinkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PatternLinkError::config("semantic_threshold out of range");
        assert_eq!(err.to_string(), "config error: semantic_threshold out of range");

        let err = PatternLinkError::validation("document has no patterns");
        assert!(err.to_string().contains("no patterns"));
    }

    #[test]
    fn io_error_keeps_path() {
        let err = PatternLinkError::io(
            "/tmp/kb.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("kb.json"));
        assert!(msg.contains("missing"));
    }
}
