//! Error types for flashee operations
//!
//! Synchronous rejections of the public API are represented by the FeeError
//! enum. Outcomes of accepted jobs are reported as `JobResult` values instead,
//! because they only become known on a later tick.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// flashee error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum FeeError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Engine used before `init()` or after `shutdown()`
    #[error("engine is not initialized")]
    Uninit,

    /// Block number is neither configured nor a registered custom block
    #[error("block {block} is not configured")]
    InvalidBlockNumber {
        /// Requested block number
        block: u16,
    },

    /// Read offset lies outside the block
    #[error("offset {offset} out of range for block {block} of {size} bytes")]
    InvalidBlockOffset {
        /// Requested block number
        block: u16,
        /// Requested offset
        offset: u16,
        /// Size of the block
        size: u16,
    },

    /// Requested length does not fit the block
    #[error("length {length} at offset {offset} does not fit block {block} of {size} bytes")]
    InvalidBlockLength {
        /// Requested block number
        block: u16,
        /// Requested offset
        offset: u16,
        /// Requested length
        length: u16,
        /// Size of the block
        size: u16,
    },

    /// Job queue is full
    #[error("job queue full ({depth} jobs pending)")]
    Busy {
        /// Configured queue depth
        depth: usize,
    },

    /// The critical block froze the engine
    #[error("engine frozen by critical block {block}")]
    Frozen {
        /// The critical block number
        block: u16,
    },

    /// Cancel requested with no job pending
    #[error("no job to cancel")]
    NothingToCancel,

    /// Section erase is not running or may not be interrupted
    #[error("no cancellable section erase in progress")]
    EraseNotCancellable,

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Validation failure message
        reason: String,
    },

    /// Flash image file is malformed
    #[error("flash image {} corrupted: {reason}", .path.display())]
    ImageCorrupted {
        /// Path to the image file
        path: PathBuf,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification of a flash image failed
    #[error(
        "checksum mismatch in {}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// Image file where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
    },
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl FeeError {
    /// Wrap an I/O error with the file it concerns.
    pub fn io_at(path: &Path, err: std::io::Error, what: &str) -> Self {
        FeeError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to FeeError::Io
impl From<std::io::Error> for FeeError {
    fn from(err: std::io::Error) -> Self {
        FeeError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for flashee operations
pub type FeeResult<T> = Result<T, FeeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FeeError::ChecksumMismatch {
            path: PathBuf::from("/tmp/flash.img"),
            expected: 0x12345678,
            actual: 0x87654321,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_block_error_display() {
        let err = FeeError::InvalidBlockLength { block: 3, offset: 8, length: 12, size: 16 };
        assert_eq!(
            err.to_string(),
            "length 12 at offset 8 does not fit block 3 of 16 bytes"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fee_err: FeeError = io_err.into();

        match fee_err {
            FeeError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_at_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = FeeError::io_at(Path::new("/tmp/x.img"), io_err, "Failed to open image");
        assert!(err.to_string().contains("/tmp/x.img"));
        assert!(err.to_string().contains("Failed to open image"));
    }
}
