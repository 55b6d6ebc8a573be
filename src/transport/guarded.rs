//! Backoff and timeout around a raw request/response exchange.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use web_time::Duration;

use super::backoff::Backoff;
use super::{ClassificationTransport, ResponseCode, TransportError, TransportFuture};
use crate::classifier::PooledPayload;
use crate::config::TransportConfig;

/// A completed round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResponse {
    /// HTTP-style status.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// A round trip that produced no status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeFailure {
    /// The exchange gave up waiting.
    Timeout(String),
    /// The request could not be delivered or the response not read.
    Network(String),
}

/// Future returned by [`Exchange::post`].
pub type ExchangeFuture =
    Pin<Box<dyn Future<Output = Result<ExchangeResponse, ExchangeFailure>> + Send>>;

/// One request/response round trip with no policy of its own.
pub trait Exchange: Send + Sync {
    /// Posts `payload` to the endpoint.
    fn post(&self, payload: PooledPayload) -> ExchangeFuture;
}

/// Wraps an [`Exchange`] with backoff and a request timeout.
///
/// | Outcome | Backoff | Result |
/// |---------|---------|--------|
/// | in backoff | unchanged | `Waiting`, nothing sent |
/// | 2xx | reset | body |
/// | 403 or 5xx | escalate | error with body |
/// | other status | unchanged | error with body |
/// | timeout | unchanged | `Timeout` |
/// | network failure | escalate | `NetworkError` |
pub struct GuardedTransport<E> {
    exchange: Arc<E>,
    backoff: Arc<Backoff>,
    request_timeout: Duration,
}

impl<E: Exchange + 'static> GuardedTransport<E> {
    /// Wraps `exchange` using the timeout and backoff from `config`.
    #[must_use]
    pub fn new(exchange: E, config: &TransportConfig) -> Self {
        Self {
            exchange: Arc::new(exchange),
            backoff: Arc::new(Backoff::new(config.backoff)),
            request_timeout: config.request_timeout,
        }
    }

    /// The backoff shared by every request through this transport.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

impl<E: Exchange + 'static> ClassificationTransport for GuardedTransport<E> {
    fn send(&self, payload: PooledPayload) -> TransportFuture {
        if self.backoff.is_waiting() {
            return Box::pin(std::future::ready(Err(TransportError::new(
                ResponseCode::Waiting,
                "endpoint is in backoff",
            ))));
        }

        let request = self.exchange.post(payload);
        let backoff = Arc::clone(&self.backoff);
        let limit = self.request_timeout;

        Box::pin(async move {
            let outcome = match tokio::time::timeout(limit, request).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExchangeFailure::Timeout(format!(
                    "no response within {}ms",
                    limit.as_millis()
                ))),
            };

            match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    backoff.record_success();
                    Ok(response.body)
                },
                Ok(response) => {
                    if response.status >= 500 || response.status == 403 {
                        backoff.record_failure();
                    }
                    Err(TransportError::new(
                        ResponseCode::from_status(response.status),
                        format!("HTTP status {}: {}", response.status, response.body),
                    )
                    .with_body(response.body))
                },
                Err(ExchangeFailure::Timeout(detail)) => Err(TransportError::new(
                    ResponseCode::Timeout,
                    format!("request failed: {detail}"),
                )),
                Err(ExchangeFailure::Network(detail)) => {
                    backoff.record_failure();
                    Err(TransportError::new(
                        ResponseCode::NetworkError,
                        format!("request failed: {detail}"),
                    ))
                },
            }
        })
    }
}

impl<E> std::fmt::Debug for GuardedTransport<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedTransport")
            .field("backoff", &self.backoff)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
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
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<ExchangeResponse, ExchangeFailure>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn reply(self, reply: Result<ExchangeResponse, ExchangeFailure>) -> Self {
            self.replies.lock().push_back(reply);
            self
        }
    }

    impl Exchange for Scripted {
        fn post(&self, _payload: PooledPayload) -> ExchangeFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ExchangeFailure::Network("script exhausted".into())));
            Box::pin(std::future::ready(reply))
        }
    }

    struct Hanging;

    impl Exchange for Hanging {
        fn post(&self, _payload: PooledPayload) -> ExchangeFuture {
            Box::pin(std::future::pending())
        }
    }

    fn status(status: u16, body: &str) -> Result<ExchangeResponse, ExchangeFailure> {
        Ok(ExchangeResponse {
            status,
            body: body.to_owned(),
        })
    }

    fn guarded<E: Exchange + 'static>(exchange: E) -> GuardedTransport<E> {
        GuardedTransport::new(exchange, &TransportConfig::default())
    }

    #[tokio::test]
    async fn success_returns_the_body() {
        let transport = guarded(Scripted::default().reply(status(200, r#"{"probability":0.5}"#)));
        assert_eq!(
            transport.send(vec![1u8, 2, 3].into()).await.unwrap(),
            r#"{"probability":0.5}"#
        );
        assert!(!transport.backoff().is_waiting());
    }

    #[tokio::test]
    async fn server_errors_start_backoff_and_later_requests_wait() {
        let exchange = Scripted::default().reply(status(503, "down"));
        let transport = guarded(exchange);

        let err = transport.send(Vec::<u8>::new().into()).await.unwrap_err();
        assert_eq!(err.code, ResponseCode::ServerError);
        assert_eq!(err.body.as_deref(), Some("down"));
        assert!(transport.backoff().is_waiting());

        let err = transport.send(Vec::<u8>::new().into()).await.unwrap_err();
        assert_eq!(err.code, ResponseCode::Waiting);
        assert_eq!(transport.exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_escalates_but_other_client_errors_do_not() {
        let transport = guarded(Scripted::default().reply(status(403, "")));
        assert_eq!(
            transport.send(Vec::<u8>::new().into()).await.unwrap_err().code,
            ResponseCode::Unauthorized
        );
        assert!(transport.backoff().is_waiting());

        let transport = guarded(Scripted::default().reply(status(
            422,
            r#"{"code":"INVALID_SEQUENCE","details":{"sequence":20}}"#,
        )));
        let err = transport.send(Vec::<u8>::new().into()).await.unwrap_err();
        assert_eq!(err.code, ResponseCode::InvalidSequence);
        assert!(err.body.unwrap().contains("sequence"));
        assert!(!transport.backoff().is_waiting());
    }

    #[tokio::test]
    async fn network_failures_escalate() {
        let transport = guarded(
            Scripted::default().reply(Err(ExchangeFailure::Network("refused".into()))),
        );
        let err = transport.send(Vec::<u8>::new().into()).await.unwrap_err();
        assert_eq!(err.code, ResponseCode::NetworkError);
        assert!(transport.backoff().is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_do_not_escalate() {
        let transport = guarded(Hanging);
        let err = transport.send(Vec::<u8>::new().into()).await.unwrap_err();
        assert_eq!(err.code, ResponseCode::Timeout);
        assert!(!transport.backoff().is_waiting());
        assert_eq!(transport.backoff().current_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exchange_reported_timeouts_do_not_escalate() {
        let transport =
            guarded(Scripted::default().reply(Err(ExchangeFailure::Timeout("slow".into()))));
        assert_eq!(
            transport.send(Vec::<u8>::new().into()).await.unwrap_err().code,
            ResponseCode::Timeout
        );
        assert!(!transport.backoff().is_waiting());
    }
}
