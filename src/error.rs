//! Error types for Spectrec

use std::io;
use thiserror::Error;

/// Result type for Spectrec operations
pub type Result<T> = std::result::Result<T, SpectrecError>;

/// Errors that can occur in Spectrec
#[derive(Debug, Error)]
pub enum SpectrecError {
    /// Recording file is empty/new, or a requested segment has no entry
    #[error("recording: missing data")]
    MissingData,

    /// Attempt to overwrite a write-once segment or an indexed id
    #[error("recording: cannot modify read-only data")]
    CannotModify,

    /// Header present but undecodable, or header size overruns the file
    #[error("recording: corrupt recording")]
    CorruptRecording,

    /// Trailing version word does not match the supported format version
    #[error("recording: incompatible or invalid format version")]
    IncompatibleVersion,

    /// Encoded header exceeds the 16-bit size limit
    #[error("recording: header is too large")]
    HeaderTooLarge,

    /// Platform id absent from the platform table
    #[error("unknown platform")]
    UnknownPlatform,

    /// Upstream returned 404 for a specific resource
    #[error("not found")]
    NotFound,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary header/metadata codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// An error wrapped with the operation that produced it
    #[error("{op}: {source}")]
    Op {
        /// Label of the failed operation
        op: String,
        /// The underlying error
        #[source]
        source: Box<SpectrecError>,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl SpectrecError {
    /// Wrap the error with an operation label, building up an operation
    /// stack like `record: metadata: request URL: <cause>`.
    #[must_use]
    pub fn with_op(self, op: &str) -> Self {
        SpectrecError::Op {
            op: op.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any operation labels.
    #[must_use]
    pub fn root(&self) -> &SpectrecError {
        match self {
            SpectrecError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the underlying error is the upstream not-found sentinel.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), SpectrecError::NotFound)
    }

    /// Whether the underlying error is the missing-data sentinel.
    #[must_use]
    pub fn is_missing_data(&self) -> bool {
        matches!(self.root(), SpectrecError::MissingData)
    }
}

impl From<ciborium::ser::Error<io::Error>> for SpectrecError {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        SpectrecError::Codec(e.to_string())
    }
}

impl From<ciborium::de::Error<io::Error>> for SpectrecError {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        SpectrecError::Codec(e.to_string())
    }
}
