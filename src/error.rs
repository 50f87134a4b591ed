//! Error types for the checkpoint index
//!
//! Defines all errors that can occur while building, persisting or
//! querying a trace index.

use thiserror::Error;

/// Errors that can occur in the checkpoint index
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The trace source failed while being read
    #[error("Trace source read error at rank {rank}: {message}")]
    SourceRead { rank: u64, message: String },

    /// Persisted index is malformed (checksum mismatch, bad magic, broken tree, etc.)
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// Invalid construction parameters (zero interval, branching factor too small)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A checkpoint or record was appended out of order
    #[error("Out of order append: {0}")]
    NonMonotonic(String),

    /// The index was disposed and can no longer be used
    #[error("Index has been disposed")]
    Disposed,

    /// A background build or seek task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),
}

impl IndexError {
    /// Build a source read error for the given rank
    pub fn source_read(rank: u64, message: impl Into<String>) -> Self {
        IndexError::SourceRead {
            rank,
            message: message.into(),
        }
    }

    /// Whether this error means the persisted index should be thrown away
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::CorruptIndex(_))
    }
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::source_read(42, "unexpected eof");
        assert_eq!(
            err.to_string(),
            "Trace source read error at rank 42: unexpected eof"
        );

        let err = IndexError::Configuration("interval must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: interval must be positive"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let index_err: IndexError = io_err.into();
        assert!(matches!(index_err, IndexError::Io(_)));
        assert!(!index_err.is_corruption());
    }

    #[test]
    fn test_corruption_flag() {
        assert!(IndexError::CorruptIndex("bad crc".into()).is_corruption());
        assert!(!IndexError::Disposed.is_corruption());
    }
}
