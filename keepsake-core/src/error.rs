/*!
Error types for the Keepsake core.
*/

use thiserror::Error;

/// Result type used throughout the Keepsake core.
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Errors that can occur while building or restoring a backup.
#[derive(Error, Debug)]
pub enum KeepsakeError {
    /// I/O errors that did not come through a storage adapter
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed archive container or chunk framing
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Document payload header does not carry a known variant tag
    #[error("Unknown document format: {0}")]
    UnknownFormat(String),

    /// Document payload is shorter than its header
    #[error("Truncated document payload: {len} bytes is shorter than the header")]
    TruncatedPayload { len: usize },

    /// Cancellation was observed at a suspension point
    #[error("Operation aborted")]
    Aborted,

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal serialization failure while encoding a document
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration or argument validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote pre-check confirmed the document is corrupt
    #[error("Document rejected by pre-check: {0}")]
    PrecheckRejected(String),
}

impl KeepsakeError {
    /// Create a new corrupt archive error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptArchive(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new encoding error
    pub fn encoding<S: Into<String>>(msg: S) -> Self {
        Self::Encoding(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// True if this error is the result of cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
