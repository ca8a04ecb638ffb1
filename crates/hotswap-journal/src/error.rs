//! Error types for hotswap-journal

use thiserror::Error;

/// Journal error type
#[derive(Debug, Error)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame's stored checksum does not match its bytes
    #[error("Checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    /// The log ends in the middle of a frame
    #[error("Truncated record at offset {offset}")]
    Truncated { offset: u64 },

    /// The background file writer is gone
    #[error("Audit writer stopped")]
    WriterStopped,

    /// Export error
    #[error("Export error: {0}")]
    ExportError(String),
}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;
