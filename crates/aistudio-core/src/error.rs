//! Error types for wire decoding.

use thiserror::Error;

/// Wire decoding error type.
///
/// Only structural failures surface here. Fragment-level problems inside an
/// event scan are skipped rather than reported.
#[derive(Debug, Error)]
pub enum WireError {
    /// The response body could not be decompressed.
    #[error("decompression failed: {0}")]
    Gzip(#[from] std::io::Error),

    /// A tool-call parameter block did not have the expected shape.
    #[error("malformed tool-call parameters: {0}")]
    MalformedParams(String),
}

/// Result type for wire decoding operations.
pub type Result<T> = std::result::Result<T, WireError>;
