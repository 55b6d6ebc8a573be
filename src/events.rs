//! Notifications the classifier produces for the host.
//!
//! Events are delivered on the main context, after the evidence buffer has been updated.
//! Sinks follow the same shape as the [`telemetry`](crate::telemetry) observers: a
//! tracing sink, a collecting sink for tests and a composite that fans out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::PlayerId;

/// Name the classifier reports flags under.
pub const CHECK_NAME: &str = "AimModel";

/// Something the classifier decided about a player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ClassifierEvent {
    /// The evidence buffer crossed the flag threshold.
    FlagRaised {
        /// Who was flagged.
        player: PlayerId,
        /// Which check raised it.
        check_name: String,
        /// Probability and buffer at the time of the flag.
        debug: String,
    },
    /// The evidence buffer crossed the suspicion threshold upward.
    SuspicionRaised {
        /// Who is suspicious.
        player: PlayerId,
        /// Buffer level after the crossing.
        buffer: f64,
    },
    /// A probability was applied. Sent for every parsed response.
    PredictionUpdated {
        /// Whose window was classified.
        player: PlayerId,
        /// Probability returned by the endpoint.
        probability: f64,
        /// Buffer before this probability.
        old_buffer: f64,
        /// Buffer after this probability, after any flag reset.
        new_buffer: f64,
        /// Responses so far with a probability above 0.90.
        high_probability_ticks: u64,
        /// Whether this probability raised a flag.
        flagged: bool,
        /// Damage multiplier now in effect for the player.
        damage_multiplier: f64,
    },
}

impl ClassifierEvent {
    /// The player the event is about.
    #[must_use]
    pub fn player(&self) -> PlayerId {
        match self {
            Self::FlagRaised { player, .. }
            | Self::SuspicionRaised { player, .. }
            | Self::PredictionUpdated { player, .. } => *player,
        }
    }

    /// Serializes the event to JSON.
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Receives classifier events.
pub trait EventSink: Send + Sync {
    /// Called on the main context for each event.
    fn on_event(&self, event: &ClassifierEvent);
}

/// Logs events through `tracing`: flags at `warn`, suspicion at `info`, predictions at
/// `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &ClassifierEvent) {
        match event {
            ClassifierEvent::FlagRaised {
                player,
                check_name,
                debug: detail,
            } => tracing::warn!(player = %player, check = %check_name, "{detail}"),
            ClassifierEvent::SuspicionRaised { player, buffer } => {
                tracing::info!(player = %player, buffer, "player is suspicious");
            },
            ClassifierEvent::PredictionUpdated {
                player,
                probability,
                new_buffer,
                flagged,
                ..
            } => tracing::debug!(
                player = %player,
                probability,
                buffer = new_buffer,
                flagged,
                "prediction updated"
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ClassifierEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything received so far.
    #[must_use]
    pub fn events(&self) -> Vec<ClassifierEvent> {
        self.events.lock().clone()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of flags received.
    #[must_use]
    pub fn flags(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ClassifierEvent::FlagRaised { .. }))
            .count()
    }

    /// Buffer levels reported by each prediction, in order.
    #[must_use]
    pub fn buffers(&self) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ClassifierEvent::PredictionUpdated { new_buffer, .. } => Some(*new_buffer),
                _ => None,
            })
            .collect()
    }

    /// Forgets everything received.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &ClassifierEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards each event to several sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeSink {
    /// Creates a sink with no targets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target.
    pub fn add(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for CompositeSink {
    fn on_event(&self, event: &ClassifierEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}

impl std::fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSink")
            .field("num_sinks", &self.sinks.len())
            .finish()
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

    fn prediction(buffer: f64) -> ClassifierEvent {
        ClassifierEvent::PredictionUpdated {
            player: PlayerId::new(3),
            probability: 0.95,
            old_buffer: 0.0,
            new_buffer: buffer,
            high_probability_ticks: 1,
            flagged: false,
            damage_multiplier: 0.5,
        }
    }

    #[test]
    fn composite_fans_out() {
        let first = Arc::new(CollectingSink::new());
        let second = Arc::new(CollectingSink::new());
        let mut composite = CompositeSink::new();
        composite.add(first.clone());
        composite.add(second.clone());

        composite.on_event(&prediction(5.0));
        composite.on_event(&ClassifierEvent::FlagRaised {
            player: PlayerId::new(3),
            check_name: CHECK_NAME.to_owned(),
            debug: "prob=0.95 buffer=55.0".to_owned(),
        });

        assert_eq!(first.len(), 2);
        assert_eq!(second.flags(), 1);
        assert_eq!(second.buffers(), vec![5.0]);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tracing_sink_logs_flags_with_their_detail() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingSink.on_event(&ClassifierEvent::FlagRaised {
                player: PlayerId::new(3),
                check_name: CHECK_NAME.to_owned(),
                debug: "prob=0.95 buffer=55.0".to_owned(),
            });
            TracingSink.on_event(&prediction(5.0));
        });

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        let flag_line = output.lines().find(|line| line.contains("WARN")).unwrap();
        assert!(flag_line.contains("prob=0.95 buffer=55.0"));
        assert!(flag_line.contains("player=3"));
        assert!(output.contains("prediction updated"));
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = prediction(5.0).to_json().unwrap();
        assert!(json.contains(r#""event":"prediction_updated""#));
        assert!(json.contains(r#""player":3"#));
    }

    #[test]
    fn player_accessor() {
        let event = ClassifierEvent::SuspicionRaised {
            player: PlayerId::new(8),
            buffer: 26.0,
        };
        assert_eq!(event.player(), PlayerId::new(8));
        TracingSink.on_event(&event);
    }

    #[test]
    fn clear_forgets() {
        let sink = CollectingSink::new();
        sink.on_event(&prediction(1.0));
        sink.clear();
        assert!(sink.is_empty());
    }
}
