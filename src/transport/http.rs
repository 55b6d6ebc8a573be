//! `reqwest`-backed exchange.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;

use super::guarded::{Exchange, ExchangeFailure, ExchangeFuture, ExchangeResponse, GuardedTransport};
use super::ClassificationTransport;
use crate::classifier::PooledPayload;
use crate::config::TransportConfig;
use crate::error::{AimwatchError, AimwatchResult};

/// Posts windows as `application/octet-stream` and reads the body as text.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    client: Client,
    url: String,
}

impl HttpExchange {
    /// Builds a client with the timeouts and API key from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::TransportSetup`] if the API key is not a valid header
    /// value or the client cannot be built.
    pub fn new(config: &TransportConfig) -> AimwatchResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("aimwatch/", env!("CARGO_PKG_VERSION"))),
        );
        let mut key = HeaderValue::from_str(&config.api_key).map_err(|e| {
            AimwatchError::TransportSetup {
                context: format!("api key is not a valid header value: {e}"),
            }
        })?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AimwatchError::TransportSetup {
                context: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            url: config.url.trim().to_owned(),
        })
    }
}

impl Exchange for HttpExchange {
    fn post(&self, payload: PooledPayload) -> ExchangeFuture {
        let request = self.client.post(&self.url).body(payload.to_vec());
        Box::pin(async move {
            let response = request.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(classify)?;
            Ok(ExchangeResponse { status, body })
        })
    }
}

fn classify(error: reqwest::Error) -> ExchangeFailure {
    if error.is_timeout() {
        ExchangeFailure::Timeout(error.to_string())
    } else {
        ExchangeFailure::Network(error.to_string())
    }
}

/// Builds the transport described by `config`, or `None` when it is not usable
/// (disabled, no URL, or the placeholder API key).
///
/// # Errors
///
/// Returns [`AimwatchError::TransportSetup`] if the HTTP client cannot be built.
pub fn transport_from_config(
    config: &TransportConfig,
) -> AimwatchResult<Option<Arc<dyn ClassificationTransport>>> {
    if !config.is_usable() {
        return Ok(None);
    }
    let exchange = HttpExchange::new(config)?;
    Ok(Some(Arc::new(GuardedTransport::new(exchange, config))))
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
    fn unusable_configs_build_nothing() {
        let config = TransportConfig::default();
        assert!(transport_from_config(&config).unwrap().is_none());

        let config = TransportConfig {
            enabled: true,
            url: "   ".into(),
            api_key: "secret".into(),
            ..TransportConfig::default()
        };
        assert!(transport_from_config(&config).unwrap().is_none());
    }

    #[test]
    fn usable_config_builds_a_transport() {
        let config = TransportConfig {
            enabled: true,
            url: "http://127.0.0.1:9/classify".into(),
            api_key: "secret".into(),
            ..TransportConfig::default()
        };
        assert!(transport_from_config(&config).unwrap().is_some());
    }

    #[test]
    fn invalid_key_is_a_setup_error() {
        let config = TransportConfig {
            enabled: true,
            url: "http://127.0.0.1:9/classify".into(),
            api_key: "line\nbreak".into(),
            ..TransportConfig::default()
        };
        assert!(matches!(
            HttpExchange::new(&config),
            Err(AimwatchError::TransportSetup { .. })
        ));
    }
}
