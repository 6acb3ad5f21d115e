//! Error types for Errata.
//!
//! Library crates use [`ErrataError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Errata operations.
#[derive(Debug, thiserror::Error)]
pub enum ErrataError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Input data error (missing dataset columns, malformed values, etc.).
    #[error("data error: {message}")]
    Data { message: String },

    /// Judgment oracle error (transport setup, prompt rendering).
    #[error("oracle error: {0}")]
    Oracle(String),

    /// A taxonomy sub-problem failed. Carries the sub-problem identity so
    /// the failing branch can be located and retried.
    #[error("taxonomy error at depth {depth} under '{parent}': {message}")]
    Taxonomy {
        depth: usize,
        parent: String,
        message: String,
    },

    /// Stage cache read/write error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ErrataError>;

impl ErrataError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a data error from any displayable message.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data {
            message: msg.into(),
        }
    }

    /// Attach a sub-problem identity (recursion depth, parent category) to a
    /// failure so the user can retry the exact branch.
    pub fn taxonomy(depth: usize, parent: impl Into<String>, source: ErrataError) -> Self {
        Self::Taxonomy {
            depth,
            parent: parent.into(),
            message: source.to_string(),
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
        let err = ErrataError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ErrataError::data("dataset 'gpqa.csv' is missing column 'score'");
        assert!(err.to_string().contains("gpqa.csv"));
    }

    #[test]
    fn taxonomy_error_names_the_branch() {
        let inner = ErrataError::data("no parseable taxonomy judgment");
        let err = ErrataError::taxonomy(2, "Reasoning Errors", inner);
        let msg = err.to_string();
        assert!(msg.contains("depth 2"));
        assert!(msg.contains("Reasoning Errors"));
    }
}
