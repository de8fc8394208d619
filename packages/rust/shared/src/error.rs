//! Error types for html2doc.
//!
//! Library crates use [`Html2DocError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all html2doc operations.
#[derive(Debug, thiserror::Error)]
pub enum Html2DocError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The HTML document could not be turned into sections at all.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Transport, auth, or rate-limit failure from the language model.
    /// Always fatal for the document that issued the call.
    #[error("model call failed: {0}")]
    ModelCall(String),

    /// A model answer that does not match the requested structure.
    /// Recovered locally by the stage that issued the call.
    #[error("malformed model response: {message}")]
    MalformedResponse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON serialization of an output artifact failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data validation error (invalid state, inconsistent references, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, Html2DocError>;

impl Html2DocError {
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

    /// Create a malformed-response error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse {
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

    /// Whether the error aborts the whole document rather than one section.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedResponse { .. })
    }
}
