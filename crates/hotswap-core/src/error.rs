//! Error types for hotswap-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("State codec error: {0}")]
    Codec(String),

    #[error("Blob is not an encoded module state (bad magic)")]
    InvalidStateMagic,

    #[error("Unsupported state format version {0}")]
    UnsupportedFormat(u8),

    #[error("Invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
