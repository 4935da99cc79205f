//! Shared error types for the thoughtstore system.

use thiserror::Error;

/// Top-level error type for memory operations.
#[derive(Error, Debug)]
pub enum ThoughtError {
    /// The requested thought was not found.
    #[error("Thought not found: {0}")]
    ThoughtNotFound(String),

    /// The requested note key is absent on the thought.
    #[error("Note not found: {0}")]
    NoteNotFound(String),

    /// Malformed caller input (blank intent, blank key, bad vector).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The backing store failed (connectivity, constraint, transaction).
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backing store is temporarily locked by another writer.
    #[error("Storage busy: {0}")]
    Busy(String),

    /// The operation's context was canceled or its deadline passed.
    #[error("Operation canceled")]
    Canceled,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing thought or note key.
    NotFound,
    /// Malformed input or configuration.
    Validation,
    /// Connectivity, transaction, or internal failure.
    Storage,
    /// Context canceled or timed out.
    Canceled,
}

impl ThoughtError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ThoughtNotFound(_) | Self::NoteNotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Canceled => ErrorKind::Canceled,
            Self::Storage(_) | Self::Busy(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// True for missing thoughts and missing note keys.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when a read may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Alias for Result with ThoughtError.
pub type ThoughtResult<T> = Result<T, ThoughtError>;
