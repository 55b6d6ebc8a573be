//! One player's pipeline, from inbound packets to classifier ticks.
//!
//! A [`Connection`] is owned by the network-receive context. It ties together the
//! [`TransactionClock`], the [`MovementReconciler`], the [`SensitivityEstimator`], the
//! [`TickSampler`] and the [`BehaviorClassifier`]. The network-send side talks to the same
//! clock and correction queues through an [`OutboundHandle`], which is cheap to clone and
//! safe to use from any thread.
//!
//! ```text
//!  inbound ──► Connection::handle_inbound
//!                 │ Acknowledgment ──► TransactionClock::on_acknowledgment
//!                 │ Attack          ──► TickSampler::on_attack
//!                 │ Movement        ──► MovementReconciler::reconcile
//!                 │                        │ sample ──► SensitivityEstimator
//!                 │                        │ genuine ──► TickSampler ──► BehaviorClassifier
//!                 │                        │ genuine/duplicate ──► RecordingSession
//!
//!  outbound ──► OutboundHandle::{send_marker, register_teleport, register_forced_rotation}
//! ```

use std::sync::Arc;

use crate::classifier::{BehaviorClassifier, ClassificationService, ClassifierHandle, TickOutcome};
use crate::config::AimwatchConfig;
use crate::error::AimwatchResult;
use crate::estimator::{SensitivityEstimator, SensitivityReadout};
use crate::network::messages::{
    ClientEra, MovementReport, PendingRotation, PendingTeleport, Position, RelativeFlags,
    Rotation,
};
use crate::network::reconciler::{CorrectionQueues, MovementReconciler, ReportVerdict};
use crate::network::transaction_clock::{DeferredTask, TransactionClock, TransactionStamp};
use crate::recording::{RecordingSession, RECORDING_COMBAT_TICKS};
use crate::sampler::{TickFeature, TickSampler};
use crate::telemetry::ViolationObserver;
use crate::PlayerId;

/// A decoded inbound packet the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundPacket {
    /// A movement report.
    Movement(MovementReport),
    /// The client answered a marker.
    Acknowledgment(i16),
    /// The client attacked an entity.
    Attack {
        /// Whether the entity is another player.
        target_is_player: bool,
    },
}

/// What the host should do with an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Pass it on.
    Forward,
    /// Drop it: it is ours, or a duplicate the policy cancels.
    Cancel,
}

/// The send side of a connection.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    clock: Arc<TransactionClock>,
    corrections: Arc<CorrectionQueues>,
}

impl OutboundHandle {
    /// Issues a marker for the host to send.
    #[must_use = "the marker must be sent to the client"]
    pub fn send_marker(&self) -> TransactionStamp {
        self.clock.send_marker()
    }

    /// Records a server teleport. Send the returned marker right after the teleport.
    #[must_use = "the marker must be sent to the client"]
    pub fn register_teleport(&self, target: Position, relative: RelativeFlags) -> TransactionStamp {
        let (stamp, transaction) = self.clock.send_numbered_marker();
        self.corrections.push_teleport(PendingTeleport {
            target,
            relative,
            transaction,
        });
        stamp
    }

    /// Records a server-forced rotation. Send the returned marker right after it.
    #[must_use = "the marker must be sent to the client"]
    pub fn register_forced_rotation(&self, target: Rotation) -> TransactionStamp {
        let (stamp, transaction) = self.clock.send_numbered_marker();
        self.corrections.push_rotation(PendingRotation {
            target,
            transaction,
        });
        stamp
    }

    /// Runs `task` once the client has acknowledged `transaction`.
    pub fn defer_effect(&self, transaction: u32, task: DeferredTask) {
        self.clock.defer_effect(transaction, task);
    }

    /// Runs `task` once the client has acknowledged the next marker.
    pub fn defer_to_next_marker(&self, task: DeferredTask) {
        self.clock.defer_to_next_marker(task);
    }

    /// The clock this handle writes to.
    #[must_use]
    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }
}

/// One player's aim analysis pipeline.
pub struct Connection {
    player: PlayerId,
    clock: Arc<TransactionClock>,
    corrections: Arc<CorrectionQueues>,
    reconciler: MovementReconciler,
    estimator: SensitivityEstimator,
    sampler: TickSampler,
    classifier: BehaviorClassifier,
    recording: Option<RecordingSession>,
}

impl Connection {
    /// Creates the pipeline for a newly connected player.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::InvalidConfig`](crate::AimwatchError::InvalidConfig) if
    /// the estimator or reconciler config does not validate.
    pub fn new(
        player: PlayerId,
        era: ClientEra,
        config: &AimwatchConfig,
        service: Arc<ClassificationService>,
    ) -> AimwatchResult<Self> {
        config.estimator.validate()?;
        config.reconciler.validate()?;

        let clock = Arc::new(TransactionClock::new());
        let corrections = Arc::new(CorrectionQueues::new());
        let reconciler = MovementReconciler::new(
            player,
            config.reconciler,
            era,
            Arc::clone(&clock),
            Arc::clone(&corrections),
        );
        let sampler = TickSampler::new(service.sequence());
        Ok(Self {
            player,
            clock,
            corrections,
            reconciler,
            estimator: SensitivityEstimator::new(&config.estimator),
            sampler,
            classifier: BehaviorClassifier::new(player, service),
            recording: None,
        })
    }

    /// Routes reconciliation and skipped-marker violations to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.clock.set_observer(Arc::clone(&observer));
        self.reconciler = self.reconciler.with_observer(observer);
        self
    }

    /// The player this pipeline belongs to.
    #[must_use]
    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// A handle for the network-send side.
    #[must_use]
    pub fn outbound(&self) -> OutboundHandle {
        OutboundHandle {
            clock: Arc::clone(&self.clock),
            corrections: Arc::clone(&self.corrections),
        }
    }

    /// A handle for reading classifier results from other threads.
    #[must_use]
    pub fn classifier_handle(&self) -> ClassifierHandle {
        self.classifier.handle()
    }

    /// Processes one inbound packet.
    pub fn handle_inbound(&mut self, packet: &InboundPacket) -> Disposition {
        match packet {
            InboundPacket::Acknowledgment(id) => {
                if self.clock.on_acknowledgment(*id) {
                    Disposition::Cancel
                } else {
                    Disposition::Forward
                }
            },
            InboundPacket::Attack { target_is_player } => {
                if *target_is_player {
                    self.sampler.on_attack();
                }
                Disposition::Forward
            },
            InboundPacket::Movement(report) => self.on_movement(report),
        }
    }

    fn on_movement(&mut self, report: &MovementReport) -> Disposition {
        self.sampler.on_movement();
        let result = self.reconciler.reconcile(report);
        if let Some(sample) = result.sample {
            self.estimator.observe(sample);
        }

        match result.verdict {
            ReportVerdict::Cancelled => return Disposition::Cancel,
            ReportVerdict::TeleportEcho | ReportVerdict::RotationEcho => {
                return Disposition::Forward
            },
            ReportVerdict::Genuine | ReportVerdict::Duplicate => {},
        }

        let tick = TickSampler::sample(self.reconciler.orientation(), &self.estimator);
        if result.verdict == ReportVerdict::Genuine {
            self.feed_classifier(tick);
        }
        if self.sampler.ticks_since_attack() < RECORDING_COMBAT_TICKS {
            if let Some(recording) = self.recording.as_mut() {
                recording.record(tick);
            }
        }
        Disposition::Forward
    }

    fn feed_classifier(&mut self, tick: TickFeature) -> TickOutcome {
        let eligible = self
            .sampler
            .is_eligible(self.classifier.service().sequence());
        self.classifier.on_tick(tick, eligible)
    }

    /// Starts recording ticks under `status`, replacing any session in progress.
    pub fn start_recording(&mut self, player_name: impl Into<String>, status: impl Into<String>) {
        self.recording = Some(RecordingSession::new(player_name, status));
    }

    /// Stops recording and hands back the session.
    pub fn stop_recording(&mut self) -> Option<RecordingSession> {
        self.recording.take()
    }

    /// The session being recorded, if any.
    #[must_use]
    pub fn recording(&self) -> Option<&RecordingSession> {
        self.recording.as_ref()
    }

    /// Sensitivity estimate for both axes.
    #[must_use]
    pub fn sensitivity(&self) -> SensitivityReadout {
        self.estimator.readout()
    }

    /// Movement reports since the player last attacked another player.
    #[must_use]
    pub fn ticks_since_attack(&self) -> u32 {
        self.sampler.ticks_since_attack()
    }

    /// The reconciler, for orientation and position state.
    #[must_use]
    pub fn reconciler(&self) -> &MovementReconciler {
        &self.reconciler
    }

    /// Changes the client's duplicate-packet era.
    pub fn set_era(&mut self, era: ClientEra) {
        self.reconciler.set_era(era);
    }

    /// The classifier, for window and state inspection.
    #[must_use]
    pub fn classifier(&self) -> &BehaviorClassifier {
        &self.classifier
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("player", &self.player)
            .field("clock", &self.clock)
            .field("reconciler", &self.reconciler)
            .field("classifier", &self.classifier)
            .field("recording", &self.recording.as_ref().map(RecordingSession::len))
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
    use crate::events::CollectingSink;
    use crate::scheduler::{MainQueue, TokioScheduler};

    fn service(config: &AimwatchConfig) -> Arc<ClassificationService> {
        let main = Arc::new(MainQueue::new());
        let scheduler = Arc::new(TokioScheduler::try_current(main).unwrap());
        Arc::new(
            ClassificationService::new(
                scheduler,
                Arc::new(CollectingSink::new()),
                config.classifier(),
            )
            .unwrap(),
        )
    }

    fn connection(era: ClientEra) -> Connection {
        let config = AimwatchConfig::default();
        Connection::new(PlayerId::new(1), era, &config, service(&config)).unwrap()
    }

    fn turn(yaw: f32, pitch: f32) -> InboundPacket {
        InboundPacket::Movement(MovementReport::rotation(Rotation::new(yaw, pitch), true))
    }

    #[tokio::test]
    async fn own_acknowledgments_are_swallowed() {
        let mut conn = connection(ClientEra::Modern);
        let stamp = conn.outbound().send_marker();
        assert_eq!(
            conn.handle_inbound(&InboundPacket::Acknowledgment(stamp.id)),
            Disposition::Cancel
        );
        assert_eq!(
            conn.handle_inbound(&InboundPacket::Acknowledgment(123)),
            Disposition::Forward
        );
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn connection_is_send() {
        assert_send::<Connection>();
        assert_send::<MovementReconciler>();
    }

    #[tokio::test]
    async fn connection_moves_between_receive_threads() {
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let mut conn = connection(ClientEra::Modern).with_observer(observer.clone());
        conn.handle_inbound(&turn(1.0, 0.0));

        let conn = std::thread::spawn(move || {
            conn.handle_inbound(&turn(2.0, 0.5));
            conn
        })
        .join()
        .unwrap();

        assert_eq!(conn.reconciler().orientation().yaw, 2.0);
        assert!(observer.is_empty());
    }

    #[tokio::test]
    async fn attacks_on_players_reset_combat_ticks() {
        let mut conn = connection(ClientEra::Modern);
        assert_eq!(conn.ticks_since_attack(), 41);
        conn.handle_inbound(&InboundPacket::Attack {
            target_is_player: false,
        });
        assert_eq!(conn.ticks_since_attack(), 41);
        conn.handle_inbound(&InboundPacket::Attack {
            target_is_player: true,
        });
        conn.handle_inbound(&turn(1.0, 0.0));
        assert_eq!(conn.ticks_since_attack(), 1);
    }

    #[tokio::test]
    async fn recording_only_samples_near_combat() {
        let mut conn = connection(ClientEra::Modern);
        conn.start_recording("Steve", "LEGIT");
        conn.handle_inbound(&turn(1.0, 0.0));
        assert!(conn.recording().unwrap().is_empty());

        conn.handle_inbound(&InboundPacket::Attack {
            target_is_player: true,
        });
        conn.handle_inbound(&turn(2.0, 0.5));
        conn.handle_inbound(&turn(3.5, 1.0));
        let session = conn.stop_recording().unwrap();
        assert_eq!(session.len(), 2);
        assert!(conn.recording().is_none());
    }

    #[tokio::test]
    async fn forced_rotation_echo_is_not_recorded() {
        let mut conn = connection(ClientEra::Modern);
        conn.start_recording("Steve", "CHEAT");
        conn.handle_inbound(&InboundPacket::Attack {
            target_is_player: true,
        });
        let outbound = conn.outbound();
        let stamp = outbound.register_forced_rotation(Rotation::new(90.0, 0.0));
        conn.handle_inbound(&InboundPacket::Acknowledgment(stamp.id));

        conn.handle_inbound(&turn(90.0, 0.0));
        assert!(conn.recording().unwrap().is_empty());
        assert_eq!(conn.reconciler().orientation().yaw, 90.0);
    }

    #[tokio::test]
    async fn strict_duplicates_are_cancelled() {
        let config = AimwatchConfig {
            reconciler: crate::config::ReconcilerConfig::strict(),
            ..AimwatchConfig::default()
        };
        let mut conn =
            Connection::new(PlayerId::new(2), ClientEra::Coarse, &config, service(&config)).unwrap();

        let position = Position::new(5.0, 64.0, 5.0);
        let first = MovementReport::full(position, Rotation::new(10.0, 0.0), true);
        assert_eq!(
            conn.handle_inbound(&InboundPacket::Movement(first)),
            Disposition::Forward
        );
        let repeat = MovementReport::full(position, Rotation::new(12.0, 0.0), true);
        assert_eq!(
            conn.handle_inbound(&InboundPacket::Movement(repeat)),
            Disposition::Cancel
        );
    }

    #[tokio::test]
    async fn deferred_effects_ride_the_outbound_handle() {
        let conn = connection(ClientEra::Modern);
        let outbound = conn.outbound();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        outbound.defer_to_next_marker(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let first = outbound.send_marker();
        let _second = outbound.send_marker();

        assert!(outbound.clock().on_acknowledgment(first.id));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
