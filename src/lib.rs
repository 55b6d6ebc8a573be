//! # Aimwatch
//!
//! Aimwatch is a real-time aim-analysis pipeline for game servers, written in 100% safe Rust.
//! It watches the movement and rotation reports each connected player sends, strips out
//! the reports that merely echo server corrections, and turns the rest into per-tick
//! features. Sliding windows of those features go to a remote classification endpoint,
//! whose probabilities build per-player evidence that ends in suspicion and flag events
//! plus a damage multiplier the game can apply.
//!
//! ```text
//!  inbound packets                                           remote endpoint
//!        │                                                         ▲
//!        ▼                                                         │ window
//!  ┌────────────┐  acks   ┌──────────────────┐                     │
//!  │ Connection │────────►│ TransactionClock │         ┌───────────┴───────────┐
//!  └─────┬──────┘         └──────────────────┘         │ ClassificationService │
//!        │ movement                                    └───────────┬───────────┘
//!        ▼                                                         │ probability
//!  ┌────────────────────┐  rotation  ┌──────────────────────┐      ▼
//!  │ MovementReconciler │───────────►│ SensitivityEstimator │  evidence buffer
//!  └─────────┬──────────┘            └──────────┬───────────┘  events, damage
//!            │ orientation                      │ sensitivity       ▲
//!            ▼                                  ▼                   │
//!      ┌─────────────┐      tick       ┌────────────────────┐       │
//!      │ TickSampler │────────────────►│ BehaviorClassifier │───────┘
//!      └─────────────┘                 └────────────────────┘
//! ```
//!
//! The host owns one [`Connection`] per player on its network-receive context and feeds
//! it every [`InboundPacket`]. Results are read back through the [`ConnectionRegistry`]
//! or by subscribing an [`EventSink`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use classifier::{
    BehaviorClassifier, ClassificationError, ClassificationService, ClassifierHandle,
    ClassifierState, NoRegions, PooledPayload, RegionFilter, TickOutcome, Verdict,
};
pub use config::{
    AimwatchConfig, BackoffConfig, ClassifierConfig, DamageConfig, EstimatorConfig,
    EvidenceConfig, ReconcilerConfig, TransportConfig, WindowConfig,
};
pub use connection::{Connection, Disposition, InboundPacket, OutboundHandle};
pub use error::{AimwatchError, AimwatchResult, ConfigErrorKind};
pub use estimator::{SensitivityEstimator, SensitivityReadout};
pub use events::{ClassifierEvent, CollectingSink, CompositeSink, EventSink, TracingSink};
pub use network::messages::{
    ClientEra, MovementReport, PendingRotation, PendingTeleport, Position, RelativeFlags,
    Rotation, RotationSample,
};
pub use network::reconciler::{MovementReconciler, Orientation, ReportVerdict};
pub use network::transaction_clock::{DeferredTask, TransactionClock, TransactionStamp};
pub use recording::{RecordingLabel, RecordingSession};
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use sampler::{TickFeature, TickSampler};
pub use scheduler::{MainQueue, Scheduler, TaskHandle, TokioScheduler};
pub use transport::{ClassificationTransport, ResponseCode, TransportError};

pub mod classifier;
pub mod config;
pub mod connection;
#[doc(hidden)]
pub mod error;
pub mod estimator;
pub mod events;
pub mod math;
pub mod recording;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
#[doc(hidden)]
pub mod network {
    pub mod codec;
    pub mod messages;
    pub mod reconciler;
    pub mod transaction_clock;
}

/// Internal module exposing implementation details for testing and benchmarking.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here may change without
/// notice and is not covered by semver. It exists so property tests and benchmarks can
/// drive internal components directly:
/// - **RunningMode**: bounded mode tracker behind each estimator axis
/// - **ClassificationWindow**: the sliding window with its dispatch stride
/// - **EvidenceBuffer**: probability accumulation and flag reset
/// - **SnapshotPool**: reusable window snapshots
#[doc(hidden)]
pub mod __internal {
    pub use crate::classifier::{ClassificationWindow, EvidenceBuffer, SnapshotPool};
    pub use crate::estimator::RunningMode;
    pub use crate::math::{convert_to_sensitivity, gcd, quantization_error};
    pub use crate::network::codec::{decode_window, encode_window};
    pub use crate::network::reconciler::CorrectionQueues;
    pub use crate::transport::Backoff;
}

/// Identifies one connected player.
///
/// The host picks the numbering; aimwatch only needs it to be stable for the lifetime of
/// a connection.
///
/// # Examples
///
/// ```
/// use aimwatch::PlayerId;
///
/// let player = PlayerId::new(7);
/// assert_eq!(player.as_u64(), 7);
/// assert_eq!(player.to_string(), "7");
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(u64);

impl PlayerId {
    /// Creates a new `PlayerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PlayerId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PlayerId> for u64 {
    #[inline]
    fn from(player: PlayerId) -> Self {
        player.0
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
    fn player_id_serializes_as_a_bare_number() {
        let json = serde_json::to_string(&PlayerId::new(42)).unwrap();
        assert_eq!(json, "42");
        let back: PlayerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PlayerId::new(42));
    }

    #[test]
    fn player_ids_order_numerically() {
        let mut players = vec![PlayerId::new(9), PlayerId::from(2), PlayerId::new(5)];
        players.sort();
        assert_eq!(players, vec![PlayerId::new(2), PlayerId::new(5), PlayerId::new(9)]);
        assert_eq!(u64::from(players[0]), 2);
    }
}
