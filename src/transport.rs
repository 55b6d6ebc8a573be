//! The seam between the classifier and the remote classification endpoint.
//!
//! A [`ClassificationTransport`] takes an encoded window and eventually yields the
//! response body or a [`TransportError`]. The crate ships [`GuardedTransport`], which adds
//! backoff and a request timeout around any [`Exchange`] (a single request/response
//! round trip), and, behind the `http` feature, an exchange built on `reqwest`.
//!
//! # Error codes
//!
//! Failures carry a [`ResponseCode`]. Positive codes mirror HTTP statuses; negative codes
//! describe failures that never produced a status:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 200 | success |
//! | 400 | bad request (and any other 4xx) |
//! | 403 | unauthorized |
//! | 422 | window size rejected; the body names the expected size |
//! | 500 | server error (and any other 5xx) |
//! | -1 | timed out |
//! | -2 | network failure |
//! | -3 | response could not be parsed |
//! | -4 | unknown |
//! | -5 | endpoint in backoff, request not attempted |

mod backoff;
mod guarded;
#[cfg(feature = "http")]
mod http;

pub use backoff::Backoff;
pub use guarded::{Exchange, ExchangeFailure, ExchangeFuture, ExchangeResponse, GuardedTransport};
#[cfg(feature = "http")]
pub use http::{transport_from_config, HttpExchange};

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::classifier::PooledPayload;

/// Outcome category of a transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// 200.
    Success,
    /// 400, or any unlisted 4xx.
    BadRequest,
    /// 403.
    Unauthorized,
    /// 422: the endpoint expects a different window size.
    InvalidSequence,
    /// 500, or any unlisted 5xx.
    ServerError,
    /// The request timed out.
    Timeout,
    /// The request never completed.
    NetworkError,
    /// The response body was not understood.
    ParseError,
    /// Anything else.
    Unknown,
    /// The endpoint is backing off; nothing was sent.
    Waiting,
}

impl ResponseCode {
    const ALL: [Self; 10] = [
        Self::Success,
        Self::BadRequest,
        Self::Unauthorized,
        Self::InvalidSequence,
        Self::ServerError,
        Self::Timeout,
        Self::NetworkError,
        Self::ParseError,
        Self::Unknown,
        Self::Waiting,
    ];

    /// Numeric code: the HTTP status, or a negative value for local failures.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 403,
            Self::InvalidSequence => 422,
            Self::ServerError => 500,
            Self::Timeout => -1,
            Self::NetworkError => -2,
            Self::ParseError => -3,
            Self::Unknown => -4,
            Self::Waiting => -5,
        }
    }

    /// Maps an HTTP status to a code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        let status = i32::from(status);
        if let Some(code) = Self::ALL.iter().find(|code| code.code() == status) {
            return *code;
        }
        if status >= 500 {
            Self::ServerError
        } else if status >= 400 {
            Self::BadRequest
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidSequence => "INVALID_SEQUENCE",
            Self::ServerError => "SERVER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
            Self::Waiting => "WAITING",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// A failed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// What went wrong.
    pub code: ResponseCode,
    /// Human-readable detail.
    pub message: String,
    /// Response body, when the endpoint answered.
    pub body: Option<String>,
}

impl TransportError {
    /// Creates an error without a response body.
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            body: None,
        }
    }

    /// Attaches the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Future returned by [`ClassificationTransport::send`].
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send>>;

/// Sends an encoded window and yields the raw response body.
pub trait ClassificationTransport: Send + Sync {
    /// Starts sending `payload`. The returned future does the I/O; the payload goes back
    /// to its pool once the transport drops it.
    fn send(&self, payload: PooledPayload) -> TransportFuture;
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

    #[test]
    fn listed_statuses_map_exactly() {
        assert_eq!(ResponseCode::from_status(200), ResponseCode::Success);
        assert_eq!(ResponseCode::from_status(400), ResponseCode::BadRequest);
        assert_eq!(ResponseCode::from_status(403), ResponseCode::Unauthorized);
        assert_eq!(ResponseCode::from_status(422), ResponseCode::InvalidSequence);
        assert_eq!(ResponseCode::from_status(500), ResponseCode::ServerError);
    }

    #[test]
    fn unlisted_statuses_map_by_class() {
        assert_eq!(ResponseCode::from_status(404), ResponseCode::BadRequest);
        assert_eq!(ResponseCode::from_status(429), ResponseCode::BadRequest);
        assert_eq!(ResponseCode::from_status(503), ResponseCode::ServerError);
        assert_eq!(ResponseCode::from_status(302), ResponseCode::Unknown);
        assert_eq!(ResponseCode::from_status(100), ResponseCode::Unknown);
    }

    #[test]
    fn local_codes_are_negative() {
        assert_eq!(ResponseCode::Timeout.code(), -1);
        assert_eq!(ResponseCode::NetworkError.code(), -2);
        assert_eq!(ResponseCode::ParseError.code(), -3);
        assert_eq!(ResponseCode::Unknown.code(), -4);
        assert_eq!(ResponseCode::Waiting.code(), -5);
    }

    #[test]
    fn error_display_names_the_code() {
        let err = TransportError::new(ResponseCode::InvalidSequence, "HTTP status 422")
            .with_body("{}");
        assert_eq!(err.to_string(), "INVALID_SEQUENCE (422): HTTP status 422");
        assert_eq!(err.body.as_deref(), Some("{}"));
    }
}
