//! Parsing of classification endpoint response bodies.
//!
//! Success bodies carry `probability` as a number or as a numeric string. Error bodies
//! may carry `details.sequence`, the window size the endpoint expects.

use serde::Deserialize;
use serde_json::Value;

/// Why a success body could not be turned into a probability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParseError {
    /// What was wrong with the body.
    pub reason: String,
}

impl std::fmt::Display for ResponseParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unreadable classification response: {}", self.reason)
    }
}

impl std::error::Error for ResponseParseError {}

#[derive(Deserialize)]
struct SuccessBody {
    probability: Option<Value>,
}

#[derive(Deserialize)]
struct ErrorBody {
    details: Option<ErrorDetails>,
}

#[derive(Deserialize)]
struct ErrorDetails {
    sequence: Option<Value>,
}

/// Extracts the probability from a success body.
///
/// # Errors
///
/// Returns [`ResponseParseError`] if the body is not JSON, has no `probability`, or the
/// probability is neither a number nor a string holding one.
pub fn parse_probability(body: &str) -> Result<f64, ResponseParseError> {
    let parsed: SuccessBody = serde_json::from_str(body).map_err(|e| ResponseParseError {
        reason: e.to_string(),
    })?;
    match parsed.probability {
        Some(Value::Number(number)) => number.as_f64().ok_or_else(|| ResponseParseError {
            reason: format!("probability {number} is not representable"),
        }),
        Some(Value::String(text)) => text.trim().parse::<f64>().map_err(|e| ResponseParseError {
            reason: format!("probability {text:?} is not a number: {e}"),
        }),
        Some(other) => Err(ResponseParseError {
            reason: format!("probability has unexpected type: {other}"),
        }),
        None => Err(ResponseParseError {
            reason: "missing probability".to_owned(),
        }),
    }
}

/// Reads `details.sequence` from an error body. Blank, malformed or missing gives `None`.
#[must_use]
pub fn parse_sequence(body: Option<&str>) -> Option<i64> {
    let body = body?.trim();
    if body.is_empty() {
        return None;
    }
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.details?.sequence? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
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
    fn probability_as_number_or_string() {
        assert_eq!(parse_probability(r#"{"probability":0.93}"#).unwrap(), 0.93);
        assert_eq!(parse_probability(r#"{"probability":"0.25"}"#).unwrap(), 0.25);
        assert_eq!(parse_probability(r#"{"probability":1}"#).unwrap(), 1.0);
    }

    #[test]
    fn bad_probabilities_are_errors() {
        assert!(parse_probability("").is_err());
        assert!(parse_probability("not json").is_err());
        assert!(parse_probability("{}").is_err());
        assert!(parse_probability(r#"{"probability":null}"#).is_err());
        assert!(parse_probability(r#"{"probability":"high"}"#).is_err());
        assert!(parse_probability(r#"{"probability":[0.5]}"#).is_err());
    }

    #[test]
    fn sequence_from_error_details() {
        let body = r#"{"code":"INVALID_SEQUENCE","details":{"sequence":20}}"#;
        assert_eq!(parse_sequence(Some(body)), Some(20));
        assert_eq!(parse_sequence(Some(r#"{"details":{"sequence":0}}"#)), Some(0));
        assert_eq!(parse_sequence(Some(r#"{"details":{"sequence":-4}}"#)), Some(-4));
    }

    #[test]
    fn missing_sequences_are_none() {
        assert_eq!(parse_sequence(None), None);
        assert_eq!(parse_sequence(Some("   ")), None);
        assert_eq!(parse_sequence(Some("<html>")), None);
        assert_eq!(parse_sequence(Some(r#"{"code":"X"}"#)), None);
        assert_eq!(parse_sequence(Some(r#"{"details":{}}"#)), None);
        assert_eq!(parse_sequence(Some(r#"{"details":{"sequence":2.5}}"#)), None);
    }
}
