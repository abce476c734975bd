//! Error types for cubecat-core.

use std::io;

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
///
/// Every failure surface of the engine maps onto one of these variants.
/// `Config` and `TargetLocked` are raised before any target mutation and
/// therefore never trigger a rollback.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration validation or merge failure
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The target is locked by another writer
    #[error("Target is locked: {0}")]
    TargetLocked(String),

    /// Slice polling timed out
    #[error("Slice unavailable: {0}")]
    SliceUnavailable(String),

    /// A slice does not match the cube schema
    #[error("Slice schema mismatch: {0}")]
    SliceSchema(String),

    /// A slice has the wrong size along the append dimension
    #[error("Slice shape mismatch: {0}")]
    SliceShape(String),

    /// Append-axis labels violate the configured step constraint
    #[error("Append order violation: {0}")]
    AppendOrder(String),

    /// A filesystem operation failed
    #[error("I/O error: cannot {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    /// The journal or rollback engine detected an inconsistency.
    /// `notes` collects rollback failures attached to the original cause.
    #[error("Transaction failed: {message}{}", format_notes(.notes))]
    Transaction {
        message: String,
        notes: Vec<String>,
    },

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Invariant violation; should never occur in production
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_notes(notes: &[String]) -> String {
    if notes.is_empty() {
        String::new()
    } else {
        format!(" (rollback notes: {})", notes.join("; "))
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an I/O error for an operation on a path
    pub fn io(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Create a transaction error without rollback notes
    pub fn transaction(msg: impl Into<String>) -> Self {
        Error::Transaction {
            message: msg.into(),
            notes: Vec::new(),
        }
    }

    /// Create an internal invariant-violation error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Attach rollback failure notes to this error.
    ///
    /// The original error stays the user-visible cause; non-transaction
    /// errors are left untouched and the notes are logged by the caller.
    pub fn with_notes(self, extra: Vec<String>) -> Self {
        if extra.is_empty() {
            return self;
        }
        match self {
            Error::Transaction { message, mut notes } => {
                notes.extend(extra);
                Error::Transaction { message, notes }
            }
            other => Error::Transaction {
                message: other.to_string(),
                notes: extra,
            },
        }
    }
}
