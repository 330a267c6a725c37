//! Error types shared across the crate.

use thiserror::Error;

/// Errors that can occur while working with image stacks and label arrays.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed image array, malformed header data, or an operation that the
    /// current stack state does not permit.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what was malformed
        message: String,
    },

    /// No registered format adapter claims the locator with nonzero confidence.
    #[error("unknown format: {locator}")]
    UnknownFormat {
        /// Human-readable description of the locator that was probed
        locator: String,
    },

    /// Out-of-range slice index.
    #[error("slice index {index} out of range for stack of {len} slices")]
    Index {
        /// The index as given by the caller (may be negative)
        index: isize,
        /// Stack depth at the time of the call
        len: usize,
    },

    /// Mutation attempted on a read-only stack.
    #[error("stack is read-only")]
    ReadOnly,

    /// Write attempted on a read-only header field.
    #[error("header field '{field}' is read-only")]
    ReadOnlyField {
        /// Name of the field
        field: String,
    },

    /// Field name rejected by the format's naming rule.
    #[error("header field '{field}' is not allowed by this format")]
    UnknownField {
        /// Name of the field
        field: String,
    },

    /// A required header field is absent, or removal of one was attempted.
    #[error("required header field '{field}' must be present")]
    MissingField {
        /// Name of the field
        field: String,
    },

    /// Header field value failed its cast or range check.
    #[error("invalid value for header field '{field}': {message}")]
    InvalidFieldValue {
        /// Name of the field
        field: String,
        /// Description of the failure
        message: String,
    },

    /// No integer type in the allowed width ladder covers the observed value
    /// range without clipping.
    #[error("no integer type covers values {min}..={max} at the requested width")]
    IncompatibleRange {
        /// Smallest observed value
        min: i128,
        /// Largest observed value
        max: i128,
    },

    /// I/O error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error (header sidecars)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the 2D image codecs
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// Error reading an NPY file
    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// Error writing an NPY file
    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] with a formatted message.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::Index { index: -3, len: 2 };
        assert_eq!(
            e.to_string(),
            "slice index -3 out of range for stack of 2 slices"
        );

        let e = Error::IncompatibleRange { min: -1, max: 300 };
        assert!(e.to_string().contains("-1..=300"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
