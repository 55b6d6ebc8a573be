//! Remote classification of aim windows and the evidence state built from it.
//!
//! Two pieces cooperate:
//!
//! - [`ClassificationService`] is shared by every connection. It owns the transport, the
//!   classifier config, the negotiated window size, the scheduler and the event sink.
//! - [`BehaviorClassifier`] is owned by one connection. It collects [`TickFeature`]s into
//!   a [`ClassificationWindow`], dispatches full windows through the service and applies
//!   the resulting probabilities to the connection's [`EvidenceBuffer`].
//!
//! # Threading
//!
//! [`BehaviorClassifier::on_tick`] runs on the network-receive context. A dispatch copies
//! the window into a pooled snapshot, encodes it into a pooled payload, runs the request
//! with [`Scheduler::run_async`], and hands the outcome back with
//! [`Scheduler::run_on_main_now`]. The outcome is applied on the main context only if
//! the connection still exists; a disconnected player's response is dropped.
//!
//! # Outcomes
//!
//! | Outcome | Damage | Evidence | Log |
//! |---------|--------|----------|-----|
//! | no transport | reset | unchanged | none |
//! | probability | from probability | updated, events sent | `debug` on `aimwatch::probability` |
//! | unreadable body | reset | unchanged | `warn` |
//! | window size rejected | reset | unchanged | `info` when the size changes |
//! | endpoint in backoff | reset | unchanged | none |
//! | timeout | reset | unchanged | `debug` on `aimwatch::timeout` |
//! | other transport error | reset | unchanged | `warn` |

pub mod damage;
mod evidence;
mod pool;
mod response;
mod state;

pub use evidence::{EvidenceBuffer, EvidenceUpdate, HIGH_PROBABILITY, LOW_PROBABILITY};
pub use pool::{PooledPayload, PooledSnapshot, SnapshotPool, DEFAULT_POOL_LIMIT};
pub use response::{parse_probability, parse_sequence, ResponseParseError};
pub use state::{ClassificationWindow, ClassifierState};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{ClassifierConfig, MAX_WINDOW_SEQUENCE};
use crate::error::AimwatchResult;
use crate::events::{ClassifierEvent, EventSink, CHECK_NAME};
use crate::network::codec::{self, CodecError};
use crate::sampler::TickFeature;
use crate::scheduler::Scheduler;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::transport::{ClassificationTransport, ResponseCode, TransportError};
use crate::{report_violation, PlayerId};

/// Answers whether evidence gathering is switched off where a player stands.
pub trait RegionFilter: Send + Sync {
    /// True if the player is inside a region with classification disabled.
    fn is_in_disabled_region(&self, player: PlayerId) -> bool;
}

/// A [`RegionFilter`] with no disabled regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRegions;

impl RegionFilter for NoRegions {
    fn is_in_disabled_region(&self, _player: PlayerId) -> bool {
        false
    }
}

/// A successful classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// No transport is installed; nothing was sent.
    Disabled,
    /// The endpoint's probability that the window is cheating.
    Probability(f64),
}

/// A failed classification.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClassificationError {
    /// The window could not be encoded.
    Encode(CodecError),
    /// The transport failed.
    Transport(TransportError),
    /// The endpoint answered, but not with a probability.
    Parse {
        /// Why the body was rejected.
        source: ResponseParseError,
        /// The body as received.
        body: String,
    },
    /// The endpoint expects windows of a different size.
    SequenceMismatch {
        /// The size it asked for.
        expected: i64,
    },
}

impl fmt::Display for ClassificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "failed to encode window: {err}"),
            Self::Transport(err) => write!(f, "{err}"),
            Self::Parse { source, body } => write!(f, "{source} (body: {body})"),
            Self::SequenceMismatch { expected } => {
                write!(f, "endpoint expects windows of {expected} ticks")
            },
        }
    }
}

impl std::error::Error for ClassificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            Self::Transport(err) => Some(err),
            Self::Parse { source, .. } => Some(source),
            Self::SequenceMismatch { .. } => None,
        }
    }
}

/// The classification side shared by every connection.
pub struct ClassificationService {
    transport: RwLock<Option<Arc<dyn ClassificationTransport>>>,
    config: RwLock<ClassifierConfig>,
    sequence: AtomicUsize,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn EventSink>,
    regions: Arc<dyn RegionFilter>,
    pool: SnapshotPool,
}

impl ClassificationService {
    /// Creates a service with no transport and no disabled regions.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::InvalidConfig`](crate::AimwatchError::InvalidConfig) if
    /// `config` does not validate.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        events: Arc<dyn EventSink>,
        config: ClassifierConfig,
    ) -> AimwatchResult<Self> {
        config.validate()?;
        Ok(Self {
            transport: RwLock::new(None),
            config: RwLock::new(config),
            sequence: AtomicUsize::new(config.window.sequence),
            scheduler,
            events,
            regions: Arc::new(NoRegions),
            pool: SnapshotPool::default(),
        })
    }

    /// Installs a transport.
    #[must_use]
    pub fn with_transport(self, transport: Arc<dyn ClassificationTransport>) -> Self {
        *self.transport.write() = Some(transport);
        self
    }

    /// Installs a region filter.
    #[must_use]
    pub fn with_region_filter(mut self, regions: Arc<dyn RegionFilter>) -> Self {
        self.regions = regions;
        self
    }

    /// Uses `pool` for window snapshots and encoded payloads.
    #[must_use]
    pub fn with_pool(mut self, pool: SnapshotPool) -> Self {
        self.pool = pool;
        self
    }

    /// Swaps the transport and config. The window size goes back to the configured one.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::InvalidConfig`](crate::AimwatchError::InvalidConfig) and
    /// changes nothing if `config` does not validate.
    pub fn reload(
        &self,
        transport: Option<Arc<dyn ClassificationTransport>>,
        config: ClassifierConfig,
    ) -> AimwatchResult<()> {
        config.validate()?;
        let enabled = transport.is_some();
        *self.transport.write() = transport;
        *self.config.write() = config;
        self.sequence
            .store(config.window.sequence, Ordering::Release);
        tracing::info!(
            enabled,
            sequence = config.window.sequence,
            step = config.window.step,
            "classification service reloaded"
        );
        Ok(())
    }

    /// Builds the transport from `transport` and reloads with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config does not validate or the client cannot be built.
    #[cfg(feature = "http")]
    pub fn reload_from_config(
        &self,
        transport: &crate::config::TransportConfig,
        config: ClassifierConfig,
    ) -> AimwatchResult<()> {
        transport.validate()?;
        let built = crate::transport::transport_from_config(transport)?;
        self.reload(built, config)
    }

    /// True while a transport is installed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.transport.read().is_some()
    }

    /// The current config.
    pub fn config(&self) -> ClassifierConfig {
        *self.config.read()
    }

    /// Ticks per window, after any renegotiation.
    #[must_use]
    pub fn sequence(&self) -> usize {
        self.sequence.load(Ordering::Acquire)
    }

    /// The snapshot pool dispatches draw from.
    #[must_use]
    pub fn pool(&self) -> &SnapshotPool {
        &self.pool
    }

    fn transport(&self) -> Option<Arc<dyn ClassificationTransport>> {
        self.transport.read().clone()
    }

    /// Sends one window and interprets the response.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError`] when the window cannot be encoded, the transport
    /// fails, the body holds no probability, or the endpoint asks for another window size.
    pub async fn classify(&self, window: &[TickFeature]) -> Result<Verdict, ClassificationError> {
        let Some(transport) = self.transport() else {
            return Ok(Verdict::Disabled);
        };
        let mut payload = self.pool.payload();
        codec::encode_window_append(window, &mut payload).map_err(ClassificationError::Encode)?;
        match transport.send(payload).await {
            Ok(body) => match parse_probability(&body) {
                Ok(probability) => Ok(Verdict::Probability(probability)),
                Err(source) => Err(ClassificationError::Parse { source, body }),
            },
            Err(err) if err.code == ResponseCode::InvalidSequence => {
                match parse_sequence(err.body.as_deref()) {
                    Some(expected) => Err(ClassificationError::SequenceMismatch { expected }),
                    None => Err(ClassificationError::Transport(err)),
                }
            },
            Err(err) => Err(ClassificationError::Transport(err)),
        }
    }

    fn adopt_sequence(&self, expected: i64) {
        let Some(size) = usize::try_from(expected)
            .ok()
            .filter(|size| (1..=MAX_WINDOW_SEQUENCE).contains(size))
        else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Classifier,
                "endpoint asked for an unusable window size {}",
                expected
            );
            return;
        };
        if self.sequence.swap(size, Ordering::AcqRel) != size {
            tracing::info!(sequence = size, "received new window size");
        }
    }

    fn apply(&self, player: PlayerId, shared: &ClassifierShared, outcome: ClassificationOutcome) {
        match outcome {
            Ok(Verdict::Probability(probability)) => {
                self.apply_probability(player, shared, probability);
            },
            Ok(Verdict::Disabled) => shared.reset_damage(),
            Err(err) => {
                shared.reset_damage();
                self.apply_error(player, err);
            },
        }
    }

    fn apply_probability(&self, player: PlayerId, shared: &ClassifierShared, probability: f64) {
        let config = self.config();
        let damage = damage::damage_multiplier(probability, &config.damage);
        shared.store_probability(probability, damage);

        let (update, high_probability_ticks) = {
            let mut evidence = shared.evidence.lock();
            let update = evidence.observe(probability, &config.evidence);
            (update, evidence.high_probability_ticks())
        };

        if update.suspicious {
            self.events.on_event(&ClassifierEvent::SuspicionRaised {
                player,
                buffer: update.raised,
            });
        }
        tracing::debug!(
            target: "aimwatch::probability",
            player = %player,
            "Prob: {:.4} | Buffer: {:.2} -> {:.2} | Damage Multiplier: {:.2}",
            probability,
            update.old,
            update.raised,
            damage
        );
        if update.flagged {
            self.events.on_event(&ClassifierEvent::FlagRaised {
                player,
                check_name: CHECK_NAME.to_owned(),
                debug: format!("prob={probability:.2} buffer={:.1}", update.raised),
            });
        }
        self.events.on_event(&ClassifierEvent::PredictionUpdated {
            player,
            probability,
            old_buffer: update.old,
            new_buffer: update.new,
            high_probability_ticks,
            flagged: update.flagged,
            damage_multiplier: damage,
        });
    }

    fn apply_error(&self, player: PlayerId, err: ClassificationError) {
        match err {
            ClassificationError::SequenceMismatch { expected } => self.adopt_sequence(expected),
            ClassificationError::Transport(err) => match err.code {
                ResponseCode::Waiting => {},
                ResponseCode::Timeout => tracing::debug!(
                    target: "aimwatch::timeout",
                    player = %player,
                    "classification error {}: {}",
                    err.code,
                    err.message
                ),
                _ => tracing::warn!(
                    player = %player,
                    "classification error {}: {}",
                    err.code,
                    err.message
                ),
            },
            ClassificationError::Parse { source, body } => {
                tracing::warn!(player = %player, body = %body, "{source}");
            },
            ClassificationError::Encode(err) => {
                tracing::warn!(player = %player, "failed to send window: {err}");
            },
        }
    }
}

impl fmt::Debug for ClassificationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationService")
            .field("enabled", &self.is_enabled())
            .field("sequence", &self.sequence())
            .field("config", &*self.config.read())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

type ClassificationOutcome = Result<Verdict, ClassificationError>;

/// Per-connection state touched by resumed responses.
#[derive(Debug)]
struct ClassifierShared {
    evidence: Mutex<EvidenceBuffer>,
    damage_bits: AtomicU64,
    probability_bits: AtomicU64,
    in_flight: AtomicUsize,
}

impl ClassifierShared {
    fn new() -> Self {
        Self {
            evidence: Mutex::new(EvidenceBuffer::new()),
            damage_bits: AtomicU64::new(1.0_f64.to_bits()),
            probability_bits: AtomicU64::new(0.0_f64.to_bits()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn store_probability(&self, probability: f64, damage: f64) {
        self.probability_bits
            .store(probability.to_bits(), Ordering::Release);
        self.damage_bits.store(damage.to_bits(), Ordering::Release);
    }

    fn reset_damage(&self) {
        self.store_probability(0.0, 1.0);
    }
}

/// Read access to a connection's classifier results from other threads.
#[derive(Debug, Clone)]
pub struct ClassifierHandle {
    shared: Arc<ClassifierShared>,
}

impl ClassifierHandle {
    /// Multiplier for the player's outgoing damage. `1.0` is unmodified.
    #[must_use]
    pub fn damage_multiplier(&self) -> f64 {
        f64::from_bits(self.shared.damage_bits.load(Ordering::Acquire))
    }

    /// The most recent probability, or `0.0` after a failure.
    #[must_use]
    pub fn last_probability(&self) -> f64 {
        f64::from_bits(self.shared.probability_bits.load(Ordering::Acquire))
    }

    /// Current evidence level.
    #[must_use]
    pub fn buffer(&self) -> f64 {
        self.shared.evidence.lock().value()
    }

    /// Responses so far with a probability above [`HIGH_PROBABILITY`].
    #[must_use]
    pub fn high_probability_ticks(&self) -> u64 {
        self.shared.evidence.lock().high_probability_ticks()
    }

    /// Requests dispatched and not yet applied.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

/// What [`BehaviorClassifier::on_tick`] did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No transport; the tick was ignored.
    Disabled,
    /// Too long since the last attack; the window was cleared.
    Ineligible,
    /// Added to the window.
    Collected,
    /// The window was due, but the player is in a disabled region.
    RegionSkipped,
    /// The window was sent.
    Dispatched,
}

/// One connection's window and evidence.
pub struct BehaviorClassifier {
    player: PlayerId,
    service: Arc<ClassificationService>,
    window: ClassificationWindow,
    shared: Arc<ClassifierShared>,
}

impl BehaviorClassifier {
    /// Creates a classifier for `player` with an empty window.
    #[must_use]
    pub fn new(player: PlayerId, service: Arc<ClassificationService>) -> Self {
        let window = ClassificationWindow::new(service.sequence(), service.config().window.step);
        Self {
            player,
            service,
            window,
            shared: Arc::new(ClassifierShared::new()),
        }
    }

    /// A handle for reading results from other threads.
    #[must_use]
    pub fn handle(&self) -> ClassifierHandle {
        ClassifierHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The service this classifier dispatches through.
    #[must_use]
    pub fn service(&self) -> &Arc<ClassificationService> {
        &self.service
    }

    /// The window as it stands.
    #[must_use]
    pub fn window(&self) -> &ClassificationWindow {
        &self.window
    }

    /// Where the dispatch cycle stands.
    #[must_use]
    pub fn state(&self) -> ClassifierState {
        if self.shared.in_flight.load(Ordering::Acquire) > 0 {
            ClassifierState::Dispatched
        } else if self.window.is_ready() {
            ClassifierState::WindowReady
        } else {
            ClassifierState::Idle
        }
    }

    /// Feeds one tick. `eligible` is false once the player is too far from their last
    /// attack for the window to mean anything.
    pub fn on_tick(&mut self, tick: TickFeature, eligible: bool) -> TickOutcome {
        if !self.service.is_enabled() {
            return TickOutcome::Disabled;
        }
        let config = self.service.config();
        self.window
            .resize(self.service.sequence(), config.window.step);

        if !eligible {
            self.window.reset();
            return TickOutcome::Ineligible;
        }

        self.window.push(tick);
        crate::debug_check_invariants!(self.window);
        if !self.window.is_ready() {
            return TickOutcome::Collected;
        }

        if config.region_filter_enabled && self.service.regions.is_in_disabled_region(self.player)
        {
            tracing::debug!(
                target: "aimwatch::region",
                player = %self.player,
                "player is in a disabled region, skipping classification"
            );
            self.window.mark_dispatched();
            return TickOutcome::RegionSkipped;
        }

        self.dispatch();
        self.window.mark_dispatched();
        TickOutcome::Dispatched
    }

    fn dispatch(&self) {
        let mut snapshot = self.service.pool.snapshot();
        snapshot.extend(self.window.iter().copied());
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);

        let service = Arc::clone(&self.service);
        let shared: Weak<ClassifierShared> = Arc::downgrade(&self.shared);
        let player = self.player;
        self.service.scheduler.run_async(Box::pin(async move {
            let outcome = service.classify(&snapshot).await;
            drop(snapshot);
            let resumed = Arc::clone(&service);
            service.scheduler.run_on_main_now(Box::new(move || {
                let Some(shared) = shared.upgrade() else {
                    // The in-flight counter went away with the connection.
                    tracing::debug!(player = %player, "player left before classification finished");
                    return;
                };
                resumed.apply(player, &shared, outcome);
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }));
        }));
    }
}

impl fmt::Debug for BehaviorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorClassifier")
            .field("player", &self.player)
            .field("window", &self.window)
            .field("state", &self.state())
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
    use crate::config::WindowConfig;
    use crate::events::CollectingSink;
    use crate::scheduler::{MainQueue, TokioScheduler};
    use crate::transport::TransportFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Replies from a script, recording every payload it was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedTransport {
        fn probabilities(values: &[f64]) -> Arc<Self> {
            let transport = Self::default();
            for value in values {
                transport
                    .replies
                    .lock()
                    .push_back(Ok(format!(r#"{{"probability":{value}}}"#)));
            }
            Arc::new(transport)
        }

        fn failing(err: TransportError) -> Arc<Self> {
            let transport = Self::default();
            transport.replies.lock().push_back(Err(err));
            Arc::new(transport)
        }
    }

    impl ClassificationTransport for ScriptedTransport {
        fn send(&self, payload: PooledPayload) -> TransportFuture {
            self.sent.lock().push(payload.to_vec());
            let reply = self.replies.lock().pop_front().unwrap_or_else(|| {
                Err(TransportError::new(ResponseCode::NetworkError, "script exhausted"))
            });
            Box::pin(std::future::ready(reply))
        }
    }

    struct Fixture {
        service: Arc<ClassificationService>,
        main: Arc<MainQueue>,
        events: Arc<CollectingSink>,
    }

    fn small_window() -> ClassifierConfig {
        ClassifierConfig {
            window: WindowConfig {
                sequence: 4,
                step: 2,
            },
            ..ClassifierConfig::default()
        }
    }

    fn fixture(config: ClassifierConfig, transport: Option<Arc<ScriptedTransport>>) -> Fixture {
        let main = Arc::new(MainQueue::new());
        let scheduler = Arc::new(TokioScheduler::try_current(Arc::clone(&main)).unwrap());
        let events = Arc::new(CollectingSink::new());
        let mut service = ClassificationService::new(scheduler, events.clone(), config).unwrap();
        if let Some(transport) = transport {
            service = service.with_transport(transport);
        }
        Fixture {
            service: Arc::new(service),
            main,
            events,
        }
    }

    async fn settle(main: &MainQueue, handle: &ClassifierHandle) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
            main.drain();
            if handle.in_flight() == 0 {
                return;
            }
        }
        panic!("classification never settled");
    }

    fn tick(yaw: f32) -> TickFeature {
        TickFeature {
            delta_yaw: yaw,
            ..TickFeature::default()
        }
    }

    #[tokio::test]
    async fn disabled_service_ignores_ticks() {
        let fx = fixture(small_window(), None);
        let mut classifier = BehaviorClassifier::new(PlayerId::new(1), fx.service.clone());
        assert_eq!(classifier.on_tick(tick(1.0), true), TickOutcome::Disabled);
        assert!(classifier.window().is_empty());
        assert_eq!(fx.service.classify(&[tick(1.0)]).await, Ok(Verdict::Disabled));
    }

    #[tokio::test]
    async fn dispatches_full_windows_every_stride() {
        let transport = ScriptedTransport::probabilities(&[0.5, 0.5, 0.5]);
        let fx = fixture(small_window(), Some(transport.clone()));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(1), fx.service.clone());

        let outcomes: Vec<TickOutcome> = (0..8)
            .map(|i| classifier.on_tick(tick(i as f32), true))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Collected,
                TickOutcome::Collected,
                TickOutcome::Collected,
                TickOutcome::Dispatched,
                TickOutcome::Collected,
                TickOutcome::Dispatched,
                TickOutcome::Collected,
                TickOutcome::Dispatched,
            ]
        );
        assert_eq!(classifier.state(), ClassifierState::Dispatched);

        settle(&fx.main, &classifier.handle()).await;
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 3);
        let last = codec::decode_window(&sent[2]).unwrap();
        let yaws: Vec<f32> = last.iter().map(|t| t.delta_yaw).collect();
        assert_eq!(yaws, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[tokio::test]
    async fn ineligible_tick_clears_the_window() {
        let fx = fixture(small_window(), Some(ScriptedTransport::probabilities(&[])));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(1), fx.service.clone());
        classifier.on_tick(tick(1.0), true);
        classifier.on_tick(tick(2.0), true);
        assert_eq!(classifier.on_tick(tick(3.0), false), TickOutcome::Ineligible);
        assert!(classifier.window().is_empty());
        assert_eq!(classifier.window().since_dispatch(), 0);
    }

    #[tokio::test]
    async fn probabilities_build_evidence() {
        let fx = fixture(
            ClassifierConfig {
                window: WindowConfig {
                    sequence: 1,
                    step: 1,
                },
                ..ClassifierConfig::default()
            },
            Some(ScriptedTransport::probabilities(&[0.95, 0.95, 0.95])),
        );
        let mut classifier = BehaviorClassifier::new(PlayerId::new(4), fx.service.clone());
        let handle = classifier.handle();

        for _ in 0..3 {
            assert_eq!(classifier.on_tick(tick(1.0), true), TickOutcome::Dispatched);
            settle(&fx.main, &handle).await;
        }

        let buffers = fx.events.buffers();
        assert_eq!(buffers.len(), 3);
        for (actual, expected) in buffers.iter().zip([5.0, 10.0, 15.0]) {
            assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
        }
        assert_eq!(handle.high_probability_ticks(), 3);
        assert!((handle.damage_multiplier() - 0.5).abs() < 1e-9);
        assert!((handle.last_probability() - 0.95).abs() < 1e-12);
    }

    #[tokio::test]
    async fn flag_resets_buffer_and_reports() {
        let config = ClassifierConfig {
            window: WindowConfig {
                sequence: 1,
                step: 1,
            },
            ..ClassifierConfig::default()
        };
        let fx = fixture(config, Some(ScriptedTransport::probabilities(&[1.0; 6])));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(2), fx.service.clone());
        let handle = classifier.handle();
        for _ in 0..6 {
            classifier.on_tick(tick(1.0), true);
            settle(&fx.main, &handle).await;
        }

        assert_eq!(fx.events.flags(), 1);
        assert_eq!(handle.buffer(), 25.0);
        let events = fx.events.events();
        assert!(events.iter().any(|event| matches!(
            event,
            ClassifierEvent::SuspicionRaised { buffer, .. } if (*buffer - 30.0).abs() < 1e-9
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            ClassifierEvent::FlagRaised { debug, .. } if debug == "prob=1.00 buffer=60.0"
        )));
    }

    #[tokio::test]
    async fn sequence_mismatch_resizes_windows() {
        let err = TransportError::new(ResponseCode::InvalidSequence, "HTTP status 422")
            .with_body(r#"{"code":"INVALID_SEQUENCE","details":{"sequence":2}}"#);
        let fx = fixture(small_window(), Some(ScriptedTransport::failing(err)));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(3), fx.service.clone());
        for i in 0..4 {
            classifier.on_tick(tick(i as f32), true);
        }
        settle(&fx.main, &classifier.handle()).await;

        assert_eq!(fx.service.sequence(), 2);
        assert!(fx.events.is_empty());
        classifier.on_tick(tick(9.0), true);
        assert_eq!(classifier.window().capacity(), 2);
        assert_eq!(classifier.window().len(), 1);
    }

    #[tokio::test]
    async fn unusable_sequences_are_ignored() {
        let err = TransportError::new(ResponseCode::InvalidSequence, "HTTP status 422")
            .with_body(r#"{"details":{"sequence":0}}"#);
        let fx = fixture(small_window(), Some(ScriptedTransport::failing(err)));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(3), fx.service.clone());
        for i in 0..4 {
            classifier.on_tick(tick(i as f32), true);
        }
        settle(&fx.main, &classifier.handle()).await;
        assert_eq!(fx.service.sequence(), 4);
    }

    #[tokio::test]
    async fn classify_maps_failures() {
        let fx = fixture(
            small_window(),
            Some(Arc::new(ScriptedTransport {
                replies: Mutex::new(VecDeque::from([
                    Ok("{}".to_owned()),
                    Err(TransportError::new(ResponseCode::InvalidSequence, "422").with_body("")),
                    Err(TransportError::new(ResponseCode::Waiting, "backoff")),
                ])),
                sent: Mutex::new(Vec::new()),
            })),
        );
        let window = [tick(1.0)];
        assert!(matches!(
            fx.service.classify(&window).await,
            Err(ClassificationError::Parse { .. })
        ));
        assert!(matches!(
            fx.service.classify(&window).await,
            Err(ClassificationError::Transport(TransportError {
                code: ResponseCode::InvalidSequence,
                ..
            }))
        ));
        assert!(matches!(
            fx.service.classify(&window).await,
            Err(ClassificationError::Transport(TransportError {
                code: ResponseCode::Waiting,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn payload_buffers_are_reused_across_requests() {
        let transport = ScriptedTransport::probabilities(&[0.5, 0.5]);
        let fx = fixture(small_window(), Some(transport.clone()));
        let window = [tick(1.0), tick(2.0), tick(3.0)];

        assert_eq!(fx.service.classify(&window).await, Ok(Verdict::Probability(0.5)));
        assert_eq!(fx.service.pool().idle_payloads(), 1);
        assert_eq!(fx.service.classify(&window).await, Ok(Verdict::Probability(0.5)));
        assert_eq!(fx.service.pool().idle_payloads(), 1);

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(codec::decode_window(&sent[1]).unwrap(), window.to_vec());
    }

    #[tokio::test]
    async fn failures_reset_damage() {
        let transport = Arc::new(ScriptedTransport {
            replies: Mutex::new(VecDeque::from([
                Ok(r#"{"probability":1.0}"#.to_owned()),
                Err(TransportError::new(ResponseCode::Timeout, "slow")),
            ])),
            sent: Mutex::new(Vec::new()),
        });
        let config = ClassifierConfig {
            window: WindowConfig {
                sequence: 1,
                step: 1,
            },
            ..ClassifierConfig::default()
        };
        let fx = fixture(config, Some(transport));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(5), fx.service.clone());
        let handle = classifier.handle();

        classifier.on_tick(tick(1.0), true);
        settle(&fx.main, &handle).await;
        assert_eq!(handle.damage_multiplier(), 0.0);

        classifier.on_tick(tick(1.0), true);
        settle(&fx.main, &handle).await;
        assert_eq!(handle.damage_multiplier(), 1.0);
        assert_eq!(handle.last_probability(), 0.0);
        assert!((handle.buffer() - 10.0).abs() < 1e-9);
    }

    struct Blocked(AtomicBool);

    impl RegionFilter for Blocked {
        fn is_in_disabled_region(&self, _player: PlayerId) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn disabled_regions_skip_dispatch() {
        let transport = ScriptedTransport::probabilities(&[0.5]);
        let main = Arc::new(MainQueue::new());
        let scheduler = Arc::new(TokioScheduler::try_current(Arc::clone(&main)).unwrap());
        let regions = Arc::new(Blocked(AtomicBool::new(true)));
        let service = Arc::new(
            ClassificationService::new(scheduler, Arc::new(CollectingSink::new()), small_window())
                .unwrap()
                .with_transport(transport.clone())
                .with_region_filter(regions.clone()),
        );
        let mut classifier = BehaviorClassifier::new(PlayerId::new(6), service.clone());
        let outcomes: Vec<TickOutcome> =
            (0..4).map(|i| classifier.on_tick(tick(i as f32), true)).collect();
        assert_eq!(outcomes[3], TickOutcome::RegionSkipped);
        assert!(transport.sent.lock().is_empty());

        let mut config = small_window();
        config.region_filter_enabled = false;
        service.reload(Some(transport.clone()), config).unwrap();
        classifier.on_tick(tick(4.0), true);
        assert_eq!(classifier.on_tick(tick(5.0), true), TickOutcome::Dispatched);
    }

    #[tokio::test]
    async fn responses_for_dropped_connections_are_discarded() {
        let fx = fixture(small_window(), Some(ScriptedTransport::probabilities(&[1.0])));
        let mut classifier = BehaviorClassifier::new(PlayerId::new(7), fx.service.clone());
        for i in 0..4 {
            classifier.on_tick(tick(i as f32), true);
        }
        drop(classifier);

        for _ in 0..16 {
            tokio::task::yield_now().await;
            fx.main.drain();
        }
        assert!(fx.events.is_empty());
        assert_eq!(fx.service.pool().idle_snapshots(), 1);
        assert_eq!(fx.service.pool().idle_payloads(), 1);
    }

    #[tokio::test]
    async fn reload_rejects_bad_config_and_removes_transport() {
        let fx = fixture(small_window(), Some(ScriptedTransport::probabilities(&[])));
        let mut bad = small_window();
        bad.window.sequence = 0;
        assert!(fx.service.reload(None, bad).is_err());
        assert!(fx.service.is_enabled());

        fx.service.reload(None, small_window()).unwrap();
        assert!(!fx.service.is_enabled());
    }
}
