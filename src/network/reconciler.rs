//! Classification of inbound movement reports.
//!
//! Every movement report is sorted into one of a few kinds before anything downstream
//! sees it. Only genuine reports carry new client input; everything else would pollute
//! the sensitivity estimate and the classifier windows.
//!
//! # Classification
//!
//! ```text
//!                    ┌───────────────────────┐
//!   report ─────────►│ teleport queue match? │── yes ──► TeleportEcho
//!                    └──────────┬────────────┘
//!                               │ no
//!                    ┌──────────▼────────────┐
//!                    │ rotation queue match? │── yes ──► RotationEcho ─┐
//!                    └──────────┬────────────┘                         │
//!                               │ no                                   │
//!                               ├──────────────────────────────────────┘
//!                    ┌──────────▼────────────┐
//!                    │ duplicate artifact?   │── yes ──► Duplicate / Cancelled
//!                    └──────────┬────────────┘
//!                               │ no
//!                               ▼
//!                            Genuine
//! ```
//!
//! The duplicate check needs both a position and a rotation, so rotation echoes never
//! reach it and teleport echoes skip it explicitly.
//!
//! # Correction queues
//!
//! Corrections are matched strictly in the order they were issued. A correction is only
//! considered once the client has acknowledged the marker sent with it. If the client has
//! moved *past* that marker without echoing the correction, the correction is stale and
//! dropped; the next one is tried.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ReconcilerConfig;
use crate::network::messages::{
    ClientEra, MovementReport, PendingRotation, PendingTeleport, Position, Rotation,
    RotationSample,
};
use crate::network::transaction_clock::TransactionClock;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::PlayerId;

/// Per-axis tolerance when matching a teleport echo.
pub const TELEPORT_EPSILON: f64 = 1e-7;

/// Outstanding server-issued corrections for one connection.
///
/// Written on the network-send path, drained on the network-receive path.
#[derive(Debug, Default)]
pub struct CorrectionQueues {
    teleports: Mutex<VecDeque<PendingTeleport>>,
    rotations: Mutex<VecDeque<PendingRotation>>,
}

impl CorrectionQueues {
    /// Creates empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a teleport the client must echo.
    pub fn push_teleport(&self, teleport: PendingTeleport) {
        self.teleports.lock().push_back(teleport);
    }

    /// Queues a forced rotation the client must echo.
    pub fn push_rotation(&self, rotation: PendingRotation) {
        self.rotations.lock().push_back(rotation);
    }

    /// Teleports not yet echoed.
    #[must_use]
    pub fn pending_teleports(&self) -> usize {
        self.teleports.lock().len()
    }

    /// Forced rotations not yet echoed.
    #[must_use]
    pub fn pending_rotations(&self) -> usize {
        self.rotations.lock().len()
    }
}

/// How a report was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportVerdict {
    /// New client input.
    Genuine,
    /// The client confirming a server teleport.
    TeleportEcho,
    /// The client confirming a server-forced rotation.
    RotationEcho,
    /// A protocol-level repeat of an earlier report.
    Duplicate,
    /// A duplicate that should be dropped before the rest of the server sees it.
    Cancelled,
}

impl ReportVerdict {
    /// True for echoes of either kind.
    #[must_use]
    pub const fn is_echo(self) -> bool {
        matches!(self, Self::TeleportEcho | Self::RotationEcho)
    }
}

/// The outcome of [`MovementReconciler::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Classification of the report.
    pub verdict: ReportVerdict,
    /// Orientation change, present only for genuine reports that carried a rotation.
    pub sample: Option<RotationSample>,
}

/// Current and previous orientation.
///
/// `last_*` is the orientation before the most recent rotation change, so
/// `yaw - last_yaw` is that change.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    /// Current yaw.
    pub yaw: f32,
    /// Current pitch.
    pub pitch: f32,
    /// Yaw before the last change.
    pub last_yaw: f32,
    /// Pitch before the last change.
    pub last_pitch: f32,
}

impl Orientation {
    fn shift_to(&mut self, rotation: Rotation) {
        self.last_yaw = self.yaw;
        self.last_pitch = self.pitch;
        self.yaw = rotation.yaw;
        self.pitch = rotation.pitch;
    }
}

/// Per-connection movement classification state.
pub struct MovementReconciler {
    player: PlayerId,
    config: ReconcilerConfig,
    era: ClientEra,
    clock: Arc<TransactionClock>,
    corrections: Arc<CorrectionQueues>,
    orientation: Orientation,
    position: Position,
    last_position: Position,
    last_claimed: Position,
    last_on_ground: bool,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl MovementReconciler {
    /// Creates a reconciler reading acknowledgments from `clock` and corrections from
    /// `corrections`.
    #[must_use]
    pub fn new(
        player: PlayerId,
        config: ReconcilerConfig,
        era: ClientEra,
        clock: Arc<TransactionClock>,
        corrections: Arc<CorrectionQueues>,
    ) -> Self {
        Self {
            player,
            config,
            era,
            clock,
            corrections,
            orientation: Orientation::default(),
            position: Position::default(),
            last_position: Position::default(),
            last_claimed: Position::default(),
            last_on_ground: false,
            observer: None,
        }
    }

    /// Routes stale-correction reports to `observer` instead of the tracing log.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Classifies one report and updates orientation and position state.
    pub fn reconcile(&mut self, report: &MovementReport) -> Reconciliation {
        let teleported = report
            .position
            .is_some_and(|position| self.match_teleport(position));
        let rotated = !teleported && self.match_rotation(report);

        let verdict = if !teleported && self.is_duplicate(report) {
            self.absorb_duplicate(report)
        } else {
            if let Some(position) = report.position {
                self.last_position = self.position;
                self.position = position;
                self.last_claimed = position;
            }
            if teleported {
                tracing::debug!(
                    target: "aimwatch::reconcile",
                    player = %self.player,
                    "teleport echoed"
                );
                ReportVerdict::TeleportEcho
            } else if rotated {
                tracing::debug!(
                    target: "aimwatch::reconcile",
                    player = %self.player,
                    "forced rotation echoed"
                );
                ReportVerdict::RotationEcho
            } else {
                ReportVerdict::Genuine
            }
        };

        let mut sample = None;
        if let Some(rotation) = report.rotation {
            match verdict {
                ReportVerdict::TeleportEcho | ReportVerdict::RotationEcho => {
                    self.orientation.shift_to(rotation);
                },
                ReportVerdict::Genuine => {
                    sample = Some(RotationSample {
                        delta_yaw: rotation.yaw - self.orientation.yaw,
                        delta_pitch: rotation.pitch - self.orientation.pitch,
                    });
                    self.orientation.shift_to(rotation);
                },
                ReportVerdict::Duplicate | ReportVerdict::Cancelled => {},
            }
        }

        self.last_on_ground = report.on_ground;
        Reconciliation { verdict, sample }
    }

    fn match_teleport(&self, reported: Position) -> bool {
        let acknowledged = self.clock.acknowledged();
        let mut dropped = 0usize;
        let matched = {
            let mut queue = self.corrections.teleports.lock();
            loop {
                let Some(teleport) = queue.front().copied() else {
                    break false;
                };
                if acknowledged < teleport.transaction {
                    break false;
                }
                if reported.approx_eq(&teleport.resolve(self.position), TELEPORT_EPSILON) {
                    queue.pop_front();
                    break true;
                }
                if acknowledged > teleport.transaction {
                    queue.pop_front();
                    dropped += 1;
                    continue;
                }
                break false;
            }
        };

        if dropped > 0 {
            report_violation_to!(
                &self.observer,
                self.player,
                ViolationSeverity::Warning,
                ViolationKind::Reconciliation,
                "dropped {} stale teleport(s) at acknowledged={}",
                dropped,
                acknowledged
            );
        }
        matched
    }

    fn match_rotation(&self, report: &MovementReport) -> bool {
        let (None, Some(reported)) = (report.position, report.rotation) else {
            return false;
        };

        let acknowledged = self.clock.acknowledged();
        let mut dropped = 0usize;
        let matched = {
            let mut queue = self.corrections.rotations.lock();
            loop {
                let Some(rotation) = queue.front().copied() else {
                    break false;
                };
                if acknowledged < rotation.transaction {
                    break false;
                }
                if reported == rotation.target {
                    queue.pop_front();
                    break true;
                }
                if acknowledged > rotation.transaction {
                    queue.pop_front();
                    dropped += 1;
                    continue;
                }
                break false;
            }
        };

        if dropped > 0 {
            report_violation_to!(
                &self.observer,
                self.player,
                ViolationSeverity::Warning,
                ViolationKind::Reconciliation,
                "dropped {} stale forced rotation(s) at acknowledged={}",
                dropped,
                acknowledged
            );
        }
        matched
    }

    fn is_duplicate(&self, report: &MovementReport) -> bool {
        if self.era.is_modern() {
            return false;
        }
        let (Some(position), Some(_)) = (report.position, report.rotation) else {
            return false;
        };
        if report.in_vehicle {
            return true;
        }
        let threshold = match self.era {
            ClientEra::Coarse => self.config.coarse_duplicate_threshold,
            ClientEra::Fine => self.config.fine_duplicate_threshold,
            ClientEra::VehicleOnly | ClientEra::Modern => return false,
        };
        report.on_ground == self.last_on_ground
            && self.last_claimed.distance_squared(&position) < threshold * threshold
    }

    fn absorb_duplicate(&mut self, report: &MovementReport) -> ReportVerdict {
        tracing::debug!(
            target: "aimwatch::duplicate",
            player = %self.player,
            in_vehicle = report.in_vehicle,
            "duplicate movement report"
        );

        if !self.config.ignore_duplicate_rotation {
            if let Some(rotation) = report.rotation {
                if self.orientation.yaw != rotation.yaw || self.orientation.pitch != rotation.pitch
                {
                    self.orientation.last_yaw = self.orientation.yaw;
                    self.orientation.last_pitch = self.orientation.pitch;
                }
                self.orientation.yaw = rotation.yaw;
                self.orientation.pitch = rotation.pitch;
            }
        }

        if let Some(position) = report.position {
            self.last_claimed = position;
        }

        if self.config.cancel_duplicates {
            ReportVerdict::Cancelled
        } else {
            if let Some(position) = report.position {
                self.last_position = self.position;
                self.position = position;
            }
            ReportVerdict::Duplicate
        }
    }

    /// Current and previous orientation.
    #[must_use]
    pub fn orientation(&self) -> &Orientation {
        &self.orientation
    }

    /// Latest accepted position.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Position before the latest accepted one.
    #[must_use]
    pub fn last_position(&self) -> Position {
        self.last_position
    }

    /// Last position the client claimed, including duplicates.
    #[must_use]
    pub fn last_claimed(&self) -> Position {
        self.last_claimed
    }

    /// The client's duplicate-packet era.
    #[must_use]
    pub fn era(&self) -> ClientEra {
        self.era
    }

    /// Changes the client's era, e.g. once its protocol version is known.
    pub fn set_era(&mut self, era: ClientEra) {
        self.era = era;
    }

    /// Replaces the duplicate-handling policy.
    pub fn set_config(&mut self, config: ReconcilerConfig) {
        self.config = config;
    }
}

impl std::fmt::Debug for MovementReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MovementReconciler")
            .field("player", &self.player)
            .field("era", &self.era)
            .field("orientation", &self.orientation)
            .field("position", &self.position)
            .field("last_claimed", &self.last_claimed)
            .field("last_on_ground", &self.last_on_ground)
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
    use crate::network::messages::RelativeFlags;
    use crate::telemetry::CollectingObserver;
    use std::cell::Cell;

    struct Harness {
        clock: Arc<TransactionClock>,
        corrections: Arc<CorrectionQueues>,
        reconciler: MovementReconciler,
        newest_marker: Cell<Option<i16>>,
    }

    impl Harness {
        fn new(era: ClientEra, config: ReconcilerConfig) -> Self {
            let clock = Arc::new(TransactionClock::new());
            let corrections = Arc::new(CorrectionQueues::new());
            let reconciler = MovementReconciler::new(
                PlayerId::new(1),
                config,
                era,
                clock.clone(),
                corrections.clone(),
            );
            Self {
                clock,
                corrections,
                reconciler,
                newest_marker: Cell::new(None),
            }
        }

        fn marker(&self) -> u32 {
            let (stamp, transaction) = self.clock.send_numbered_marker();
            self.newest_marker.set(Some(stamp.id));
            transaction
        }

        fn teleport(&self, target: Position, relative: RelativeFlags) -> u32 {
            let transaction = self.marker();
            self.corrections.push_teleport(PendingTeleport {
                target,
                relative,
                transaction,
            });
            transaction
        }

        fn force_rotation(&self, target: Rotation) -> u32 {
            let transaction = self.marker();
            self.corrections.push_rotation(PendingRotation {
                target,
                transaction,
            });
            transaction
        }

        fn acknowledge_all(&self) {
            if let Some(id) = self.newest_marker.take() {
                assert!(self.clock.on_acknowledgment(id));
            }
        }
    }

    #[test]
    fn exact_teleport_echo_is_consumed() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.teleport(Position::new(10.0, 64.0, 10.0), RelativeFlags::ABSOLUTE);
        h.acknowledge_all();

        let result = h.reconciler.reconcile(&MovementReport::full(
            Position::new(10.0, 64.0, 10.0),
            Rotation::new(45.0, 10.0),
            false,
        ));
        assert_eq!(result.verdict, ReportVerdict::TeleportEcho);
        assert_eq!(result.sample, None);
        assert_eq!(h.corrections.pending_teleports(), 0);
        assert_eq!(h.reconciler.orientation().yaw, 45.0);
    }

    #[test]
    fn unacknowledged_teleport_waits() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.teleport(Position::new(10.0, 64.0, 10.0), RelativeFlags::ABSOLUTE);

        let result = h.reconciler.reconcile(&MovementReport::position(
            Position::new(10.0, 64.0, 10.0),
            false,
        ));
        assert_eq!(result.verdict, ReportVerdict::Genuine);
        assert_eq!(h.corrections.pending_teleports(), 1);
    }

    #[test]
    fn mismatch_at_the_boundary_keeps_the_correction() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.teleport(Position::new(10.0, 64.0, 10.0), RelativeFlags::ABSOLUTE);
        h.acknowledge_all();

        let result =
            h.reconciler
                .reconcile(&MovementReport::position(Position::new(0.0, 64.0, 0.0), false));
        assert_eq!(result.verdict, ReportVerdict::Genuine);
        assert_eq!(h.corrections.pending_teleports(), 1);
    }

    #[test]
    fn stale_teleport_is_dropped_and_the_next_matches() {
        let observer = Arc::new(CollectingObserver::new());
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.reconciler = MovementReconciler::new(
            PlayerId::new(1),
            ReconcilerConfig::default(),
            ClientEra::Modern,
            h.clock.clone(),
            h.corrections.clone(),
        )
        .with_observer(observer.clone());

        h.teleport(Position::new(1.0, 1.0, 1.0), RelativeFlags::ABSOLUTE);
        h.teleport(Position::new(2.0, 2.0, 2.0), RelativeFlags::ABSOLUTE);
        h.marker();
        h.acknowledge_all();

        let result =
            h.reconciler
                .reconcile(&MovementReport::position(Position::new(2.0, 2.0, 2.0), false));
        assert_eq!(result.verdict, ReportVerdict::TeleportEcho);
        assert_eq!(h.corrections.pending_teleports(), 0);
        assert_eq!(
            observer.violations_of_kind(ViolationKind::Reconciliation).len(),
            1
        );
    }

    #[test]
    fn relative_teleport_resolves_against_current_position() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.reconciler
            .reconcile(&MovementReport::position(Position::new(100.0, 70.0, 50.0), true));

        h.teleport(
            Position::new(0.5, 64.0, -1.0),
            RelativeFlags {
                x: true,
                y: false,
                z: true,
            },
        );
        h.acknowledge_all();

        let result = h
            .reconciler
            .reconcile(&MovementReport::position(Position::new(100.5, 64.0, 49.0), true));
        assert_eq!(result.verdict, ReportVerdict::TeleportEcho);
    }

    #[test]
    fn forced_rotation_echo_requires_rotation_only_report() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.force_rotation(Rotation::new(90.0, 0.0));
        h.acknowledge_all();

        let full = h.reconciler.reconcile(&MovementReport::full(
            Position::new(0.0, 0.0, 0.0),
            Rotation::new(90.0, 0.0),
            false,
        ));
        assert_eq!(full.verdict, ReportVerdict::Genuine);
        assert_eq!(h.corrections.pending_rotations(), 1);

        let echo = h
            .reconciler
            .reconcile(&MovementReport::rotation(Rotation::new(90.0, 0.0), false));
        assert_eq!(echo.verdict, ReportVerdict::RotationEcho);
        assert_eq!(echo.sample, None);
        assert_eq!(h.corrections.pending_rotations(), 0);
    }

    #[test]
    fn genuine_rotation_produces_a_delta() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        h.reconciler
            .reconcile(&MovementReport::rotation(Rotation::new(10.0, 5.0), false));
        let result = h
            .reconciler
            .reconcile(&MovementReport::rotation(Rotation::new(12.5, 4.0), false));

        assert_eq!(result.verdict, ReportVerdict::Genuine);
        assert_eq!(
            result.sample,
            Some(RotationSample {
                delta_yaw: 2.5,
                delta_pitch: -1.0,
            })
        );
        let orientation = h.reconciler.orientation();
        assert_eq!((orientation.last_yaw, orientation.yaw), (10.0, 12.5));
    }

    #[test]
    fn coarse_era_duplicate_is_suppressed() {
        let mut h = Harness::new(ClientEra::Coarse, ReconcilerConfig::default());
        let here = Position::new(5.0, 64.0, 5.0);
        h.reconciler
            .reconcile(&MovementReport::full(here, Rotation::new(0.0, 0.0), true));

        let result = h.reconciler.reconcile(&MovementReport::full(
            Position::new(5.01, 64.0, 5.0),
            Rotation::new(30.0, 0.0),
            true,
        ));
        assert_eq!(result.verdict, ReportVerdict::Duplicate);
        assert_eq!(result.sample, None);
        assert_eq!(h.reconciler.orientation().yaw, 0.0);
        assert_eq!(h.reconciler.last_claimed(), Position::new(5.01, 64.0, 5.0));
    }

    #[test]
    fn fine_era_uses_the_tighter_threshold() {
        let mut h = Harness::new(ClientEra::Fine, ReconcilerConfig::default());
        let here = Position::new(5.0, 64.0, 5.0);
        h.reconciler
            .reconcile(&MovementReport::full(here, Rotation::new(0.0, 0.0), true));

        let result = h.reconciler.reconcile(&MovementReport::full(
            Position::new(5.01, 64.0, 5.0),
            Rotation::new(30.0, 0.0),
            true,
        ));
        assert_eq!(result.verdict, ReportVerdict::Genuine);
    }

    #[test]
    fn ground_flag_change_is_not_a_duplicate() {
        let mut h = Harness::new(ClientEra::Coarse, ReconcilerConfig::default());
        let here = Position::new(5.0, 64.0, 5.0);
        h.reconciler
            .reconcile(&MovementReport::full(here, Rotation::new(0.0, 0.0), true));
        let result =
            h.reconciler
                .reconcile(&MovementReport::full(here, Rotation::new(3.0, 0.0), false));
        assert_eq!(result.verdict, ReportVerdict::Genuine);
    }

    #[test]
    fn vehicle_reports_are_duplicates_in_every_artifact_era() {
        for era in [ClientEra::VehicleOnly, ClientEra::Coarse, ClientEra::Fine] {
            let mut h = Harness::new(era, ReconcilerConfig::default());
            let report = MovementReport::full(
                Position::new(100.0, 0.0, 0.0),
                Rotation::new(1.0, 1.0),
                false,
            )
            .in_vehicle();
            assert_eq!(
                h.reconciler.reconcile(&report).verdict,
                ReportVerdict::Duplicate,
                "{era:?}"
            );
        }
    }

    #[test]
    fn vehicle_only_era_ignores_on_foot_repeats() {
        let mut h = Harness::new(ClientEra::VehicleOnly, ReconcilerConfig::default());
        let here = Position::new(5.0, 64.0, 5.0);
        h.reconciler
            .reconcile(&MovementReport::full(here, Rotation::new(0.0, 0.0), true));
        let result =
            h.reconciler
                .reconcile(&MovementReport::full(here, Rotation::new(3.0, 0.0), true));
        assert_eq!(result.verdict, ReportVerdict::Genuine);
    }

    #[test]
    fn modern_clients_skip_the_heuristic() {
        let mut h = Harness::new(ClientEra::Modern, ReconcilerConfig::default());
        let report =
            MovementReport::full(Position::default(), Rotation::new(1.0, 1.0), false).in_vehicle();
        assert_eq!(h.reconciler.reconcile(&report).verdict, ReportVerdict::Genuine);
    }

    #[test]
    fn teleport_echo_is_never_a_duplicate() {
        let mut h = Harness::new(ClientEra::Coarse, ReconcilerConfig::default());
        h.teleport(Position::new(0.0, 0.0, 0.0), RelativeFlags::ABSOLUTE);
        h.acknowledge_all();
        let report =
            MovementReport::full(Position::new(0.0, 0.0, 0.0), Rotation::new(1.0, 1.0), false)
                .in_vehicle();
        assert_eq!(
            h.reconciler.reconcile(&report).verdict,
            ReportVerdict::TeleportEcho
        );
    }

    #[test]
    fn strict_policy_cancels_duplicates() {
        let mut h = Harness::new(ClientEra::Coarse, ReconcilerConfig::strict());
        let report =
            MovementReport::full(Position::new(3.0, 0.0, 0.0), Rotation::new(1.0, 1.0), false)
                .in_vehicle();
        assert_eq!(h.reconciler.reconcile(&report).verdict, ReportVerdict::Cancelled);
        assert_eq!(h.reconciler.last_claimed(), Position::new(3.0, 0.0, 0.0));
        assert_eq!(h.reconciler.position(), Position::default());
    }

    #[test]
    fn lenient_policy_writes_duplicate_rotation_without_a_sample() {
        let mut h = Harness::new(ClientEra::Coarse, ReconcilerConfig::lenient());
        h.reconciler
            .reconcile(&MovementReport::rotation(Rotation::new(10.0, 0.0), false));
        let report =
            MovementReport::full(Position::default(), Rotation::new(20.0, 2.0), false).in_vehicle();
        let result = h.reconciler.reconcile(&report);

        assert_eq!(result.verdict, ReportVerdict::Duplicate);
        assert_eq!(result.sample, None);
        let orientation = h.reconciler.orientation();
        assert_eq!((orientation.last_yaw, orientation.yaw), (10.0, 20.0));
        assert_eq!(orientation.pitch, 2.0);
    }
}
