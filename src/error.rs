//! Error handling for the hugefill library
//!
//! Recoverable outcomes travel through [`Result`]; contract violations
//! (double free, ranges outside a tracker, operating on a tracker the
//! filler does not own) are programming errors and abort via panics at the
//! point of detection.

use thiserror::Error;

/// Main error type for the hugefill library
#[derive(Error, Debug)]
pub enum FillerError {
    /// A page range exceeds the capacity of the structure it was applied to
    #[error("Bad range: start {start}, len {len}, capacity {capacity}")]
    BadRange {
        /// First index of the offending range
        start: usize,
        /// Number of pages in the offending range
        len: usize,
        /// Capacity of the structure the range was applied to
        capacity: usize,
    },

    /// Configuration or parameter errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Feature not supported on this platform or build
    #[error("Not supported: {feature}")]
    NotSupported {
        /// Description of the unsupported feature
        feature: String,
    },
}

impl FillerError {
    /// Create a bad range error
    pub fn bad_range(start: usize, len: usize, capacity: usize) -> Self {
        Self::BadRange {
            start,
            len,
            capacity,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported<S: Into<String>>(feature: S) -> Self {
        Self::NotSupported {
            feature: feature.into(),
        }
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRange { .. } => "range",
            Self::Configuration { .. } => "config",
            Self::NotSupported { .. } => "unsupported",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FillerError>;

/// Assert that `[start, start + len)` lies within `capacity`
#[inline]
pub fn check_range(start: usize, len: usize, capacity: usize) -> Result<()> {
    match start.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(FillerError::bad_range(start, len, capacity)),
    }
}
