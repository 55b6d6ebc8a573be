//! End-to-end tests driving connections the way a server's packet hooks would.
//!
//! Each test builds a [`ClassificationService`] on the current tokio runtime with a
//! scripted transport, feeds [`InboundPacket`]s through a [`Connection`], and drains the
//! main queue until every dispatched window has been answered.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use aimwatch::network::codec::decode_window;
use aimwatch::{
    AimwatchConfig, ClassificationService, ClassificationTransport, ClassifierEvent,
    ClassifierHandle, ClientEra, CollectingSink, Connection, ConnectionRegistry, Disposition,
    InboundPacket, MainQueue, MovementReport, PlayerId, Position, PooledPayload, RelativeFlags,
    ResponseCode, Rotation, TokioScheduler, TransactionClock, TransportError, WindowConfig,
};
use aimwatch::transport::TransportFuture;
use parking_lot::Mutex;

// ============================================================================
// Harness
// ============================================================================

/// Answers requests from a script and keeps every payload it was handed.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn reply_probability(&self, probability: f64) {
        self.replies
            .lock()
            .push_back(Ok(format!(r#"{{"probability":{probability}}}"#)));
    }

    fn reply_error(&self, err: TransportError) {
        self.replies.lock().push_back(Err(err));
    }

    fn requests(&self) -> usize {
        self.sent.lock().len()
    }
}

impl ClassificationTransport for ScriptedTransport {
    fn send(&self, payload: PooledPayload) -> TransportFuture {
        self.sent.lock().push(payload.to_vec());
        let reply = self.replies.lock().pop_front().unwrap_or_else(|| {
            Err(TransportError::new(
                ResponseCode::NetworkError,
                "no scripted reply",
            ))
        });
        Box::pin(std::future::ready(reply))
    }
}

struct Harness {
    config: AimwatchConfig,
    service: Arc<ClassificationService>,
    transport: Arc<ScriptedTransport>,
    events: Arc<CollectingSink>,
    main: Arc<MainQueue>,
}

impl Harness {
    fn new(config: AimwatchConfig) -> Self {
        let main = Arc::new(MainQueue::new());
        let scheduler = Arc::new(
            TokioScheduler::try_current(Arc::clone(&main)).expect("tests run inside tokio"),
        );
        let events = Arc::new(CollectingSink::new());
        let transport = ScriptedTransport::new();
        let service = ClassificationService::new(scheduler, events.clone(), config.classifier())
            .expect("valid classifier config")
            .with_transport(transport.clone());
        Self {
            config,
            service: Arc::new(service),
            transport,
            events,
            main,
        }
    }

    fn with_window(sequence: usize, step: usize) -> Self {
        Self::new(AimwatchConfig {
            window: WindowConfig { sequence, step },
            ..AimwatchConfig::default()
        })
    }

    fn connect(&self, id: u64) -> Connection {
        Connection::new(
            PlayerId::new(id),
            ClientEra::Modern,
            &self.config,
            Arc::clone(&self.service),
        )
        .expect("valid connection config")
    }

    async fn settle(&self, handle: &ClassifierHandle) {
        for _ in 0..128 {
            tokio::task::yield_now().await;
            self.main.drain();
            if handle.in_flight() == 0 {
                return;
            }
        }
        panic!("classification never settled");
    }
}

/// Feeds `count` in-combat rotation ticks, attacking before each so every tick is eligible.
fn fight(connection: &mut Connection, start_yaw: f32, count: usize) {
    for i in 0..count {
        connection.handle_inbound(&InboundPacket::Attack {
            target_is_player: true,
        });
        let yaw = start_yaw + i as f32 * 0.75;
        let disposition = connection.handle_inbound(&InboundPacket::Movement(
            MovementReport::rotation(Rotation::new(yaw, 0.0), true),
        ));
        assert_eq!(disposition, Disposition::Forward);
    }
}

fn approx(actual: &[f64], expected: &[f64]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (a - e).abs() < 1e-9)
}

// ============================================================================
// Evidence through the full pipeline
// ============================================================================

#[tokio::test]
async fn three_confident_windows_build_five_ten_fifteen() {
    let harness = Harness::with_window(4, 4);
    for _ in 0..3 {
        harness.transport.reply_probability(0.95);
    }
    let mut connection = harness.connect(1);
    let handle = connection.classifier_handle();

    fight(&mut connection, 0.0, 12);
    harness.settle(&handle).await;

    assert_eq!(harness.transport.requests(), 3);
    assert!(approx(&harness.events.buffers(), &[5.0, 10.0, 15.0]));
    assert!((handle.buffer() - 15.0).abs() < 1e-9);
    assert_eq!(handle.high_probability_ticks(), 3);
    assert!((handle.damage_multiplier() - 0.5).abs() < 1e-9);
    assert_eq!(harness.events.flags(), 0);
}

#[tokio::test]
async fn a_low_probability_decays_the_buffer() {
    let harness = Harness::with_window(4, 4);
    harness.transport.reply_probability(0.95);
    harness.transport.reply_probability(0.95);
    harness.transport.reply_probability(0.05);
    let mut connection = harness.connect(1);
    let handle = connection.classifier_handle();

    fight(&mut connection, 0.0, 12);
    harness.settle(&handle).await;

    assert!(approx(&harness.events.buffers(), &[5.0, 10.0, 9.75]));
    assert!((handle.buffer() - 9.75).abs() < 1e-9);
    assert_eq!(handle.damage_multiplier(), 1.0);
}

#[tokio::test]
async fn window_payload_carries_the_latest_ticks() {
    let harness = Harness::with_window(4, 4);
    harness.transport.reply_probability(0.5);
    let mut connection = harness.connect(1);
    let handle = connection.classifier_handle();

    fight(&mut connection, 10.0, 4);
    harness.settle(&handle).await;

    let payload = harness.transport.sent.lock()[0].clone();
    let window = decode_window(&payload).expect("well-formed window");
    let yaws: Vec<f32> = window.iter().map(|tick| tick.delta_yaw).collect();
    // The first tick is measured from the initial orientation.
    assert_eq!(yaws, vec![10.0, 0.75, 0.75, 0.75]);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn teleport_echo_never_reaches_the_classifier() {
    let harness = Harness::with_window(4, 4);
    let mut connection = harness.connect(7);
    let outbound = connection.outbound();

    fight(&mut connection, 0.0, 2);
    let before = connection.classifier().window().len();

    let target = Position::new(10.0, 64.0, 10.0);
    let stamp = outbound.register_teleport(target, RelativeFlags::ABSOLUTE);
    assert_eq!(
        connection.handle_inbound(&InboundPacket::Acknowledgment(stamp.id)),
        Disposition::Cancel
    );

    let echo = MovementReport::full(target, Rotation::new(90.0, 0.0), true);
    assert_eq!(
        connection.handle_inbound(&InboundPacket::Movement(echo)),
        Disposition::Forward
    );
    assert_eq!(connection.classifier().window().len(), before);
    assert_eq!(connection.reconciler().position(), target);
    assert_eq!(connection.reconciler().orientation().yaw, 90.0);

    // The next genuine report is measured from the teleported orientation.
    fight(&mut connection, 91.0, 1);
    let last = connection
        .classifier()
        .window()
        .iter()
        .last()
        .copied()
        .expect("tick collected");
    assert_eq!(last.delta_yaw, 1.0);
}

#[tokio::test]
async fn unacknowledged_teleport_is_not_an_echo() {
    let harness = Harness::with_window(4, 4);
    let mut connection = harness.connect(7);
    let outbound = connection.outbound();

    let target = Position::new(10.0, 64.0, 10.0);
    let _ = outbound.register_teleport(target, RelativeFlags::ABSOLUTE);

    connection.handle_inbound(&InboundPacket::Attack {
        target_is_player: true,
    });
    let early = MovementReport::full(target, Rotation::new(5.0, 0.0), true);
    connection.handle_inbound(&InboundPacket::Movement(early));
    assert_eq!(connection.classifier().window().len(), 1);
}

// ============================================================================
// Sequence renegotiation
// ============================================================================

#[tokio::test]
async fn invalid_sequence_resizes_every_window() {
    let harness = Harness::new(AimwatchConfig::default());
    harness.transport.reply_error(
        TransportError::new(ResponseCode::InvalidSequence, "unprocessable")
            .with_body(r#"{"code":"INVALID_SEQUENCE","details":{"sequence":20}}"#),
    );
    let mut first = harness.connect(1);
    let mut second = harness.connect(2);
    let handle = first.classifier_handle();
    assert_eq!(harness.service.sequence(), 40);

    fight(&mut first, 0.0, 40);
    harness.settle(&handle).await;

    assert_eq!(harness.transport.requests(), 1);
    let payload = harness.transport.sent.lock()[0].clone();
    assert_eq!(decode_window(&payload).expect("window").len(), 40);
    assert_eq!(harness.service.sequence(), 20);

    fight(&mut first, 0.0, 1);
    fight(&mut second, 0.0, 1);
    assert_eq!(first.classifier().window().capacity(), 20);
    assert_eq!(second.classifier().window().capacity(), 20);
    assert!(harness.events.is_empty());
}

// ============================================================================
// Transaction ordering
// ============================================================================

#[tokio::test]
async fn deferred_effects_follow_acknowledgments() {
    let harness = Harness::with_window(4, 4);
    let mut connection = harness.connect(3);
    let outbound = connection.outbound();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    outbound.defer_to_next_marker(Box::new(move || log.lock().push("first")));
    let first = outbound.send_marker();
    let log = Arc::clone(&order);
    outbound.defer_to_next_marker(Box::new(move || log.lock().push("second")));
    let second = outbound.send_marker();
    assert!(order.lock().is_empty());

    connection.handle_inbound(&InboundPacket::Acknowledgment(first.id));
    assert_eq!(*order.lock(), vec!["first"]);
    connection.handle_inbound(&InboundPacket::Acknowledgment(second.id));
    assert_eq!(*order.lock(), vec!["first", "second"]);

    // Acks the server never sent belong to someone else.
    assert_eq!(
        connection.handle_inbound(&InboundPacket::Acknowledgment(1234)),
        Disposition::Forward
    );
}

#[test]
fn clock_is_shared_between_send_and_receive_threads() {
    let clock = Arc::new(TransactionClock::new());
    let ran = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let sender = {
        let clock = Arc::clone(&clock);
        let ran = Arc::clone(&ran);
        std::thread::spawn(move || {
            for i in 0..200u32 {
                let ran = Arc::clone(&ran);
                clock.defer_to_next_marker(Box::new(move || ran.lock().push(i)));
                tx.send(clock.send_marker().id).expect("receiver alive");
            }
        })
    };

    for id in rx {
        assert!(clock.on_acknowledgment(id));
    }
    sender.join().expect("sender finished");

    let ran = ran.lock();
    assert_eq!(ran.len(), 200);
    assert!(ran.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(clock.outstanding(), 0);
    assert_eq!(clock.pending_effects(), 0);
}

// ============================================================================
// Registry and events
// ============================================================================

#[tokio::test]
async fn registry_reports_flagged_players() {
    let harness = Harness::with_window(4, 4);
    for _ in 0..6 {
        harness.transport.reply_probability(1.0);
    }
    let registry = ConnectionRegistry::new();
    let mut cheater = harness.connect(1);
    let honest = harness.connect(2);
    registry.register(&cheater).expect("first registration");
    registry.register(&honest).expect("first registration");

    fight(&mut cheater, 0.0, 24);
    harness.settle(&cheater.classifier_handle()).await;

    assert_eq!(harness.events.flags(), 1);
    let flag = harness
        .events
        .events()
        .into_iter()
        .find(|event| matches!(event, ClassifierEvent::FlagRaised { .. }))
        .expect("flag raised");
    assert_eq!(flag.player(), PlayerId::new(1));

    assert_eq!(registry.last_probability(PlayerId::new(1)), Some(1.0));
    assert_eq!(registry.damage_multiplier(PlayerId::new(1)), 0.0);
    assert_eq!(registry.damage_multiplier(PlayerId::new(2)), 1.0);

    registry.remove(PlayerId::new(1)).expect("registered");
    assert_eq!(registry.players(), vec![PlayerId::new(2)]);
}
