//! Error types for shard and container operations.

use thiserror::Error;

/// Result type alias for shard and container operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds produced by the format, decode, and compute layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bytes: bad magic, truncated table, short payload,
    /// size mismatch, unknown compression code.
    #[error("format error: {message}")]
    Format { message: String },

    /// Dimension disagreement: shard shapes, input vector length,
    /// sub-vector divisibility.
    #[error("shape error: {message}")]
    Shape { message: String },

    /// Unknown scope, codebook id, or section.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Checksum mismatch. Non-fatal; surfaced by the verifier.
    #[error("integrity error: section {section} chunk {chunk} checksum mismatch")]
    Integrity { section: u32, chunk: usize },

    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Numerical failure (SVD did not converge).
    #[error("numeric error: {message}")]
    Numeric { message: String },
}

impl Error {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Error::Format {
            message: message.into(),
        }
    }

    /// Create a format error with offset context.
    pub fn format_at(message: impl Into<String>, offset: usize) -> Self {
        Error::Format {
            message: format!("{} at offset {}", message.into(), offset),
        }
    }

    /// Create a shape error.
    pub fn shape(message: impl Into<String>) -> Self {
        Error::Shape {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    /// Create a numeric error.
    pub fn numeric(message: impl Into<String>) -> Self {
        Error::Numeric {
            message: message.into(),
        }
    }

    /// Get error category for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Format { .. } => "format",
            Error::Shape { .. } => "shape",
            Error::NotFound { .. } => "not_found",
            Error::Integrity { .. } => "integrity",
            Error::Io(_) => "io",
            Error::Numeric { .. } => "numeric",
        }
    }
}
