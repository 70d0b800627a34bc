//! Error types for particle stream pipelines

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for particle stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for particle stream operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A requested channel is not present and no default was supplied
    #[error("Channel missing: {0}")]
    ChannelMissing(String),

    /// A channel exists but with a different element type or arity
    #[error("Type mismatch on channel '{channel}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Name of the offending channel
        channel: String,
        /// Type the caller asked for
        expected: String,
        /// Type actually stored in the schema
        found: String,
    },

    /// A channel with the same name was already defined
    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),

    /// The schema was already finalized
    #[error("Schema already finalized")]
    SchemaFinalized,

    /// Two schemas that must agree do not
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid operation for the current stream state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A particle file is missing or unreadable
    #[error("Source error in {path}: {message}")]
    Source {
        /// Path of the failing file
        path: PathBuf,
        /// Description of the failure
        message: String,
    },

    /// Malformed data in a particle file
    #[error("Format error: {0}")]
    Format(String),

    /// Paired streams disagree on record count, order or identity
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Work was cancelled through the progress sink
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Feature not compiled in or not supported
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Coarse classification of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel negotiation failures, detected before the first pull
    Schema,

    /// Missing or corrupt input data
    Source,

    /// Mismatched paired streams
    Consistency,

    /// External cancellation; not a fault
    Cancelled,

    /// API misuse such as out-of-range arguments
    Usage,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ChannelMissing(_)
            | Error::TypeMismatch { .. }
            | Error::DuplicateChannel(_)
            | Error::SchemaFinalized
            | Error::SchemaMismatch(_) => ErrorKind::Schema,
            Error::Io(_) | Error::Source { .. } | Error::Format(_) | Error::Serialization(_) => {
                ErrorKind::Source
            }
            Error::Consistency(_) => ErrorKind::Consistency,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidArgument(_) | Error::InvalidOperation(_) | Error::Unsupported(_) => {
                ErrorKind::Usage
            }
        }
    }

    /// Whether this error is a cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Create a source error for an unreadable file
    pub fn unreadable(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Source {
            path: path.into(),
            message: message.into(),
        }
    }
}
