use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::PlayerId;

/// Why a configuration value was rejected by `validate()`.
///
/// Kept separate from [`AimwatchError`] so validators can build the error without
/// allocating, mirroring how the config structs report ranges.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// An integer setting fell outside its allowed range.
    CountOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// A floating-point setting fell outside its allowed range, or was not finite.
    ValueOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: f64,
        /// Largest accepted value.
        max: f64,
        /// The value that was supplied.
        actual: f64,
    },
    /// A duration setting fell outside its allowed range.
    DurationOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value, in milliseconds.
        min_ms: u64,
        /// Largest accepted value, in milliseconds.
        max_ms: u64,
        /// The value that was supplied, in milliseconds.
        actual_ms: u64,
    },
    /// Two settings that must be ordered are not.
    Ordering {
        /// The field that must be the smaller of the two.
        lower: &'static str,
        /// The field that must be the larger of the two.
        upper: &'static str,
    },
}

impl Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(f, "{field} must be within {min}..={max}, got {actual}"),
            Self::ValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(f, "{field} must be within {min}..={max}, got {actual}"),
            Self::DurationOutOfRange {
                field,
                min_ms,
                max_ms,
                actual_ms,
            } => write!(
                f,
                "{field} must be within {min_ms}ms..={max_ms}ms, got {actual_ms}ms"
            ),
            Self::Ordering { lower, upper } => {
                write!(f, "{lower} must not exceed {upper}")
            },
        }
    }
}

/// This enum contains all error messages this library can return. Most API functions will
/// generally return an [`AimwatchResult<T>`].
///
/// Classifier transport failures are not in here: they never leave the classifier and are
/// handled by [`ClassificationError`](crate::classifier::ClassificationError).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AimwatchError {
    /// A configuration struct failed validation.
    InvalidConfig {
        /// What was wrong with it.
        kind: ConfigErrorKind,
    },
    /// A connection for this player is already registered.
    AlreadyRegistered {
        /// The player in question.
        player: PlayerId,
    },
    /// No connection is registered for this player.
    UnknownPlayer {
        /// The player in question.
        player: PlayerId,
    },
    /// Encoding a classification window failed.
    SerializationError {
        /// The underlying codec error.
        source: CodecError,
    },
    /// Writing a recording failed.
    RecordingError {
        /// A description of the I/O failure.
        context: String,
    },
    /// The transport could not be constructed from its configuration.
    TransportSetup {
        /// A description of what failed.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for AimwatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { kind } => write!(f, "Invalid configuration: {}", kind),
            Self::AlreadyRegistered { player } => {
                write!(f, "A connection for player {} is already registered", player)
            },
            Self::UnknownPlayer { player } => {
                write!(f, "No connection is registered for player {}", player)
            },
            Self::SerializationError { source } => write!(f, "Serialization error: {}", source),
            Self::RecordingError { context } => write!(f, "Recording error: {}", context),
            Self::TransportSetup { context } => {
                write!(f, "Could not set up classification transport: {}", context)
            },
            Self::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for AimwatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SerializationError { source } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigErrorKind> for AimwatchError {
    fn from(kind: ConfigErrorKind) -> Self {
        Self::InvalidConfig { kind }
    }
}

impl From<CodecError> for AimwatchError {
    fn from(source: CodecError) -> Self {
        Self::SerializationError { source }
    }
}

impl From<std::io::Error> for AimwatchError {
    fn from(err: std::io::Error) -> Self {
        Self::RecordingError {
            context: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type AimwatchResult<T> = Result<T, AimwatchError>;

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec::CodecOperation;

    #[test]
    fn config_error_display_names_the_field() {
        let err: AimwatchError = ConfigErrorKind::CountOutOfRange {
            field: "sequence",
            min: 1,
            max: 1024,
            actual: 0,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("sequence"));
        assert!(msg.contains("1..=1024"));
        assert!(msg.contains("got 0"));
    }

    #[test]
    fn ordering_error_display() {
        let kind = ConfigErrorKind::Ordering {
            lower: "initial_delay",
            upper: "max_delay",
        };
        assert_eq!(kind.to_string(), "initial_delay must not exceed max_delay");
    }

    #[test]
    fn codec_error_is_exposed_as_source() {
        let err: AimwatchError = CodecError::encode("boom", CodecOperation::EncodeWindow).into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn io_error_becomes_recording_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: AimwatchError = io.into();
        assert!(matches!(err, AimwatchError::RecordingError { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn player_errors_display_the_player() {
        let player = PlayerId::new(7);
        assert!(AimwatchError::UnknownPlayer { player }
            .to_string()
            .contains(&player.to_string()));
        assert!(AimwatchError::AlreadyRegistered { player }
            .to_string()
            .contains("already registered"));
    }
}
