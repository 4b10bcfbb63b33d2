//! Error types for feedingest.
//!
//! Library crates use [`IngestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Most of these kinds never escape the pipeline as `Err`: the coordinator
//! turns per-site failures into report entries. Only configuration problems,
//! an unreachable store root, and run cancellation abort an invocation.

use std::path::PathBuf;

/// Top-level error type for all feedingest operations.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The artifact store could not be reached or refused the operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A read targeted an artifact that does not exist.
    #[error("artifact not found: {path}")]
    ArtifactNotFound { path: String },

    /// No runner matches the requested site selector.
    #[error("no runner found for {selector}")]
    RunnerNotFound { selector: String },

    /// The site exists but does not implement the requested stage.
    #[error("{site} does not implement {stage}")]
    StageNotImplemented { site: String, stage: String },

    /// Record or artifact validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Error talking to the external record service.
    #[error("publish error: {0}")]
    Publish(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a storage error from any displayable message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the backing store itself is unusable.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = IngestError::config("concurrency must be at least 1");
        assert_eq!(err.to_string(), "config error: concurrency must be at least 1");

        let err = IngestError::RunnerNotFound {
            selector: "ca/nowhere".into(),
        };
        assert!(err.to_string().contains("ca/nowhere"));

        let err = IngestError::StageNotImplemented {
            site: "ca/sf_gov".into(),
            stage: "normalize".into(),
        };
        assert_eq!(err.to_string(), "ca/sf_gov does not implement normalize");
    }

    #[test]
    fn storage_classification() {
        assert!(IngestError::storage("connection refused").is_storage());
        assert!(!IngestError::config("bad").is_storage());
    }
}
