//! Binary codec for classification windows.
//!
//! A window goes over the wire as a record count followed by that many fixed-width
//! records. Each record is the eight fields of a [`TickFeature`] as little-endian
//! 32-bit floats, in declaration order:
//!
//! ```text
//! +----------------+--------------------------------------------+-----+
//! | count: u64 LE  | delta_yaw delta_pitch ... gcd_error_pitch  | ... |
//! |                | (8 x f32 LE = 32 bytes)                    |     |
//! +----------------+--------------------------------------------+-----+
//! ```
//!
//! The layout falls out of bincode's standard configuration with fixed-width integer
//! encoding, so the same config is used for every encode and decode in the crate.
//!
//! # Examples
//!
//! ```
//! use aimwatch::network::codec::{decode_window, encode_window, WINDOW_HEADER_LEN, RECORD_LEN};
//! use aimwatch::TickFeature;
//!
//! let window = vec![TickFeature::default(); 3];
//! let bytes = encode_window(&window).expect("encoding should succeed");
//! assert_eq!(bytes.len(), WINDOW_HEADER_LEN + 3 * RECORD_LEN);
//!
//! let decoded = decode_window(&bytes).expect("decoding should succeed");
//! assert_eq!(decoded, window);
//! ```

use std::fmt;

use crate::sampler::TickFeature;

/// Bytes taken by the record count.
pub const WINDOW_HEADER_LEN: usize = 8;

/// Bytes taken by one encoded [`TickFeature`].
pub const RECORD_LEN: usize = TickFeature::FIELD_COUNT * 4;

// Fixed-width integers keep the record count at a constant eight bytes, which is what
// the classification service expects.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What was being encoded or decoded when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a classification window.
    EncodeWindow,
    /// Decoding a classification window.
    DecodeWindow,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeWindow => write!(f, "encoding classification window"),
            Self::DecodeWindow => write!(f, "decoding classification window"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their messages are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Bytes were left over after the last record.
    TrailingBytes {
        /// Bytes consumed by the window.
        consumed: usize,
        /// Bytes provided.
        provided: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::TrailingBytes { consumed, provided } => {
                write!(
                    f,
                    "window used {consumed} of {provided} bytes; trailing data rejected"
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a window of tick features.
pub fn encode_window(ticks: &[TickFeature]) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(WINDOW_HEADER_LEN + ticks.len() * RECORD_LEN);
    encode_window_append(ticks, &mut buffer)?;
    Ok(buffer)
}

/// Encodes a window of tick features onto the end of `buffer`.
///
/// Lets a dispatcher reuse one allocation across windows.
pub fn encode_window_append(ticks: &[TickFeature], buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(ticks, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeWindow))
}

/// Decodes a window previously produced by [`encode_window`].
///
/// The whole slice must be consumed.
pub fn decode_window(bytes: &[u8]) -> CodecResult<Vec<TickFeature>> {
    let (ticks, consumed): (Vec<TickFeature>, usize) =
        bincode::serde::decode_from_slice(bytes, config())
            .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeWindow))?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            provided: bytes.len(),
        });
    }
    Ok(ticks)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample_tick(seed: f32) -> TickFeature {
        TickFeature {
            delta_yaw: seed,
            delta_pitch: -seed,
            accel_yaw: 0.5,
            accel_pitch: -0.25,
            jerk_yaw: 0.125,
            jerk_pitch: 2.0,
            gcd_error_yaw: 0.01,
            gcd_error_pitch: 0.0,
        }
    }

    #[test]
    fn window_layout_is_count_then_little_endian_floats() {
        let tick = sample_tick(1.5);
        let bytes = encode_window(&[tick]).unwrap();

        assert_eq!(bytes.len(), WINDOW_HEADER_LEN + RECORD_LEN);
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
        for (index, value) in tick.as_array().iter().enumerate() {
            let start = WINDOW_HEADER_LEN + index * 4;
            assert_eq!(&bytes[start..start + 4], &value.to_le_bytes(), "field {index}");
        }
    }

    #[test]
    fn empty_window_is_just_a_zero_count() {
        let bytes = encode_window(&[]).unwrap();
        assert_eq!(bytes, 0u64.to_le_bytes().to_vec());
        assert!(decode_window(&bytes).unwrap().is_empty());
    }

    #[test]
    fn window_decodes_back() {
        let window: Vec<TickFeature> = (0..40).map(|i| sample_tick(i as f32 * 0.15)).collect();
        let bytes = encode_window(&window).unwrap();
        assert_eq!(decode_window(&bytes).unwrap(), window);
    }

    #[test]
    fn append_reuses_the_buffer() {
        let mut buffer = vec![0xAA];
        let written = encode_window_append(&[sample_tick(1.0)], &mut buffer).unwrap();
        assert_eq!(written, WINDOW_HEADER_LEN + RECORD_LEN);
        assert_eq!(buffer.len(), 1 + written);
        assert_eq!(buffer[0], 0xAA);
    }

    #[test]
    fn truncated_window_is_rejected() {
        let bytes = encode_window(&[sample_tick(1.0), sample_tick(2.0)]).unwrap();
        let err = decode_window(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DecodeError {
                operation: CodecOperation::DecodeWindow,
                ..
            }
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_window(&[sample_tick(1.0)]).unwrap();
        bytes.push(0);
        assert_eq!(
            decode_window(&bytes).unwrap_err(),
            CodecError::TrailingBytes {
                consumed: WINDOW_HEADER_LEN + RECORD_LEN,
                provided: WINDOW_HEADER_LEN + RECORD_LEN + 1,
            }
        );
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::encode("boom", CodecOperation::EncodeWindow);
        assert!(err.to_string().contains("classification window"));
        assert!(err.to_string().contains("boom"));

        let err = CodecError::TrailingBytes {
            consumed: 40,
            provided: 41,
        };
        assert!(err.to_string().contains("41"));
    }
}
