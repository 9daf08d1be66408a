//! Error taxonomy for archive and extract operations.
//!
//! Executors return these to their worker pool, which keeps the first one
//! and flips into cancel mode; `close()` surfaces it. There are no retries
//! at any layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PzipError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("cannot open file: {0}")]
    FileOpen(String),

    #[error("read failed: {0}")]
    FileRead(String),

    #[error("write failed: {0}")]
    FileWrite(String),

    /// Reserved: the encoder has no internal failure mode today.
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(&'static str),

    /// Reserved: allocation failure aborts in Rust; kept for API parity.
    #[error("out of memory")]
    Memory,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, PzipError>;

impl PzipError {
    pub(crate) fn open(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::FileOpen(format!("{}: {err}", path.display()))
    }

    pub(crate) fn read(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::FileRead(format!("{}: {err}", path.display()))
    }

    pub(crate) fn write(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::FileWrite(format!("{}: {err}", path.display()))
    }
}
