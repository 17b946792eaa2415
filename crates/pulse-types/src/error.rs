//! Error types for payload decoding in pulse-types.

use thiserror::Error;

/// Errors that can occur when decoding a Heart Rate Measurement payload.
///
/// Decode failures are per-sample: the caller keeps its previous sample and
/// the notification stream carries on.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The flags declared a field that the buffer is too short to hold.
    #[error("Truncated payload: {field} needs {needed} bytes, {available} available")]
    Truncated {
        /// The field being read when the buffer ran out.
        field: &'static str,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// The payload is long enough but its layout is inconsistent.
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn truncated(field: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            field,
            needed,
            available,
        }
    }
}

/// Result type alias using pulse-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
