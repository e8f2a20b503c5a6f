//! Directional relay loop behaviour.
//!
//! Each test drives one `DirectionalLoop` from a scripted source into a
//! capturing sink and checks both the forwarded bytes and the observer
//! events.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use tds_bridge::{
    BridgeConfig, BridgeError, BridgeObserver, CancellationToken, CloseReason, ConnectionId,
    ConnectionInfo, Direction, DirectionSummary, DirectionalLoop, Endpoint, Packet, PacketType,
};
use tds_bridge_testing::{
    ObservedError, ObservedEvent, ReadStep, RecordingObserver, ScriptedEndpoint, ScriptedHandle,
    fixtures::{frame, frame_with_length},
};

const DIR: Direction = Direction::ClientToBackend;

struct Run {
    summary: DirectionSummary,
    sink: ScriptedHandle,
    observer: Arc<RecordingObserver>,
}

async fn relay_with(steps: Vec<ReadStep>, sink: ScriptedEndpoint, config: BridgeConfig) -> Run {
    let sink_handle = sink.handle();
    let (reader, _) = ScriptedEndpoint::new(steps).split();
    let (_, writer) = sink.split();
    let observer = Arc::new(RecordingObserver::new());

    let summary = DirectionalLoop::new(
        DIR,
        reader,
        writer,
        Arc::new(ConnectionInfo::new(ConnectionId(1))),
        observer.clone(),
        &config,
        CancellationToken::new(),
    )
    .run()
    .await;

    Run {
        summary,
        sink: sink_handle,
        observer,
    }
}

async fn relay(steps: Vec<ReadStep>) -> Run {
    relay_with(steps, ScriptedEndpoint::new([ReadStep::Closed]), BridgeConfig::default()).await
}

// =============================================================================
// Framing
// =============================================================================

#[tokio::test]
async fn test_single_frame_message() {
    let input = frame(0x01, 0x01, b"SELECT 1");
    assert_eq!(input.len(), 16);

    let run = relay(vec![ReadStep::data(input.clone())]).await;

    let packets = run.observer.packets(DIR);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type(), PacketType::SqlBatch);
    assert_eq!(packets[0].payload_len(), 8);

    let messages = run.observer.messages(DIR);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].packet_count(), 1);

    assert_eq!(run.sink.writes(), vec![input]);
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::EndOfStream]);
    assert!(run.observer.errors(DIR).is_empty());
    assert!(run.sink.is_shut_down());
    assert_eq!(run.summary.reason, CloseReason::EndOfStream);
}

#[tokio::test]
async fn test_two_frame_message() {
    let mut input = frame(0x04, 0x00, b"abc");
    input.extend(frame(0x04, 0x01, b"de"));

    let run = relay(vec![ReadStep::data(input.clone())]).await;

    let events = run.observer.events();
    assert!(matches!(events[0], ObservedEvent::Packet { .. }));
    assert!(matches!(events[1], ObservedEvent::Packet { .. }));
    assert!(matches!(events[2], ObservedEvent::Message { .. }));
    assert!(matches!(events[3], ObservedEvent::Closed { .. }));
    assert_eq!(events.len(), 4);

    let messages = run.observer.messages(DIR);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].packet_count(), 2);
    assert_eq!(&messages[0].payload()[..], b"abcde");

    // one write per frame
    assert_eq!(run.sink.write_count(), 2);
    assert_eq!(run.sink.written(), input);
}

#[tokio::test]
async fn test_message_state_resets_after_end_of_message() {
    let mut input = frame(0x03, 0x00, b"a");
    input.extend(frame(0x03, 0x01, b"b"));
    input.extend(frame(0x03, 0x01, b"c"));

    let run = relay(vec![ReadStep::data(input)]).await;

    let messages = run.observer.messages(DIR);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].packet_count(), 2);
    assert_eq!(messages[1].packet_count(), 1);
    assert_eq!(&messages[1].payload()[..], b"c");
}

#[tokio::test]
async fn test_packet_reported_before_its_message() {
    let run = relay(vec![ReadStep::data(frame(0x0E, 0x01, b"tx"))]).await;

    let events = run.observer.events();
    match (&events[0], &events[1]) {
        (ObservedEvent::Packet { packet, .. }, ObservedEvent::Message { message, .. }) => {
            assert_eq!(&message.packets()[0], packet);
        }
        other => panic!("unexpected event order: {other:?}"),
    }
}

#[tokio::test]
async fn test_large_frame_grows_buffer() {
    let payload = vec![0x5Au8; 12_000];
    let input = frame(0x04, 0x01, &payload);

    let run = relay(vec![ReadStep::data(input.clone())]).await;

    assert_eq!(run.observer.packets(DIR)[0].payload_len(), 12_000);
    assert_eq!(run.sink.writes(), vec![input]);
}

#[tokio::test]
async fn test_header_only_frame() {
    let input = frame(0x06, 0x01, b"");
    let run = relay(vec![ReadStep::data(input.clone())]).await;

    assert_eq!(run.observer.packets(DIR)[0].payload_len(), 0);
    assert_eq!(run.sink.writes(), vec![input]);
}

// =============================================================================
// Unframed frames
// =============================================================================

#[tokio::test]
async fn test_unframed_frame_uses_single_read() {
    // the declared length says 2560 bytes, only 200 arrive
    let header = frame_with_length(0x17, 0x00, 0x0A00, &[]);
    let payload = vec![0xABu8; 200];

    let run = relay(vec![
        ReadStep::data(header.clone()),
        ReadStep::data(payload.clone()),
    ])
    .await;

    let packets = run.observer.packets(DIR);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type(), PacketType::Unframed);
    assert_eq!(packets[0].payload_len(), 200);
    assert_eq!(packets[0].header.length, 0x0A00);

    let writes = run.sink.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len(), 208);
    assert_eq!(&writes[0][..8], &header[..]);

    assert_eq!(run.observer.closures(DIR), vec![CloseReason::EndOfStream]);
}

#[tokio::test]
async fn test_unframed_read_is_capped_and_framing_resumes() {
    let header = frame_with_length(0x17, 0x00, 0xFFFF, &[]);
    let trailing = frame(0x01, 0x01, &[0x11; 42]);
    let mut body = vec![0xCDu8; 100];
    body.extend(&trailing);

    let config = BridgeConfig::new().unframed_chunk_size(100);
    let run = relay_with(
        vec![ReadStep::data(header), ReadStep::data(body)],
        ScriptedEndpoint::new([ReadStep::Closed]),
        config,
    )
    .await;

    let packets = run.observer.packets(DIR);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].payload_len(), 100);
    assert_eq!(packets[1].packet_type(), PacketType::SqlBatch);
    assert_eq!(packets[1].payload_len(), 42);
}

#[tokio::test]
async fn test_zero_unframed_chunk_size_still_reads() {
    let header = frame_with_length(0x17, 0x00, 0x0100, &[]);

    let run = relay_with(
        vec![ReadStep::data(header), ReadStep::data(vec![0x42])],
        ScriptedEndpoint::new([ReadStep::Closed]),
        BridgeConfig::new().unframed_chunk_size(0),
    )
    .await;

    let packets = run.observer.packets(DIR);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].payload_len(), 1);
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::EndOfStream]);
}

// =============================================================================
// Read semantics
// =============================================================================

#[tokio::test]
async fn test_split_header_is_reassembled() {
    let input = frame(0x10, 0x01, b"login");

    let run = relay(vec![
        ReadStep::data(input[..3].to_vec()),
        ReadStep::data(input[3..].to_vec()),
    ])
    .await;

    assert_eq!(run.observer.packets(DIR).len(), 1);
    assert!(run.observer.errors(DIR).is_empty());
    assert_eq!(run.sink.written(), input);
}

#[tokio::test]
async fn test_payload_split_byte_by_byte() {
    let input = frame(0x12, 0x01, b"prelogin");
    let steps = input.iter().map(|b| ReadStep::data(vec![*b])).collect();

    let run = relay(steps).await;

    assert_eq!(run.observer.packets(DIR).len(), 1);
    assert_eq!(run.sink.writes(), vec![input]);
}

#[tokio::test]
async fn test_zero_read_on_boundary_closes_cleanly() {
    let run = relay(vec![ReadStep::Closed]).await;

    assert!(run.observer.packets(DIR).is_empty());
    assert!(run.observer.errors(DIR).is_empty());
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::EndOfStream]);
    assert_eq!(run.sink.write_count(), 0);
    assert!(run.sink.is_shut_down());
}

#[tokio::test(start_paused = true)]
async fn test_would_block_backs_off_and_retries() {
    let input = frame(0x01, 0x01, b"x");
    let started = tokio::time::Instant::now();

    let run = relay(vec![
        ReadStep::data(input[..4].to_vec()),
        ReadStep::WouldBlock,
        ReadStep::WouldBlock,
        ReadStep::data(input[4..].to_vec()),
    ])
    .await;

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(run.observer.errors(DIR).is_empty());
    assert_eq!(run.observer.packets(DIR).len(), 1);
    assert_eq!(run.sink.written(), input);
}

#[tokio::test]
async fn test_close_mid_payload_forwards_partial_bytes() {
    let input = frame(0x01, 0x01, b"SELECT 1");

    let run = relay(vec![ReadStep::data(input[..10].to_vec()), ReadStep::Closed]).await;

    assert!(run.observer.packets(DIR).is_empty());
    assert!(run.observer.errors(DIR).is_empty());
    assert_eq!(run.sink.written(), &input[..10]);
    assert_eq!(
        run.observer.closures(DIR),
        vec![CloseReason::UnexpectedClose { buffered: 10 }]
    );
}

#[tokio::test]
async fn test_close_mid_header_forwards_partial_bytes() {
    let input = frame(0x01, 0x01, b"x");

    let run = relay(vec![ReadStep::data(input[..5].to_vec())]).await;

    assert_eq!(run.sink.written(), &input[..5]);
    assert_eq!(run.summary.reason, CloseReason::UnexpectedClose { buffered: 5 });
    assert!(run.summary.reason.is_clean());
}

#[tokio::test]
async fn test_transparency_over_mixed_frames() {
    let mut input = Vec::new();
    input.extend(frame(0x12, 0x01, b"prelogin"));
    input.extend(frame(0xEE, 0xFF, b"unknown type, all status bits"));
    input.extend(frame(0x01, 0x08, b"reset"));
    input.extend(frame(0x01, 0x01, &[0u8; 3000]));
    input.extend(frame(0x04, 0x00, b""));
    input.extend(frame(0x04, 0x01, b"done"));

    // deliver in uneven chunks
    let steps = input.chunks(7).map(|c| ReadStep::data(c.to_vec())).collect();
    let run = relay(steps).await;

    assert_eq!(run.sink.written(), input);
    assert_eq!(run.observer.packets(DIR).len(), 6);
    assert_eq!(run.summary.stats.bytes_forwarded, input.len() as u64);

    let unknown = &run.observer.packets(DIR)[1];
    assert_eq!(unknown.packet_type(), PacketType::Other(0xEE));
    assert_eq!(unknown.header.status.bits(), 0xFF);
}

// =============================================================================
// Errors and cancellation
// =============================================================================

#[tokio::test]
async fn test_read_error_reported_once_then_closed() {
    let run = relay(vec![
        ReadStep::data(frame(0x01, 0x01, b"ok")),
        ReadStep::Error(std::io::ErrorKind::ConnectionReset),
    ])
    .await;

    assert_eq!(run.observer.packets(DIR).len(), 1);
    assert_eq!(run.observer.errors(DIR), vec![ObservedError::Transport]);
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::Error]);

    let events = run.observer.events();
    let n = events.len();
    assert!(matches!(events[n - 2], ObservedEvent::Error { .. }));
    assert!(matches!(events[n - 1], ObservedEvent::Closed { .. }));
}

#[tokio::test]
async fn test_length_below_header_is_malformed() {
    // declares 4 bytes in total; the next 4 bytes must not be taken as a header
    let mut input = frame_with_length(0x01, 0x01, 4, &[]);
    input.extend([0xAA, 0xBB, 0xCC, 0xDD]);

    let run = relay(vec![ReadStep::data(input)]).await;

    assert!(run.observer.packets(DIR).is_empty());
    assert_eq!(run.observer.errors(DIR), vec![ObservedError::MalformedHeader]);
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::Error]);
    assert_eq!(run.sink.write_count(), 0);
    assert!(run.sink.is_shut_down());
    assert_eq!(run.summary.reason, CloseReason::Error);
}

#[tokio::test]
async fn test_unframed_header_with_short_length_is_relayed() {
    let header = frame_with_length(0x17, 0x00, 0, &[]);

    let run = relay(vec![ReadStep::data(header.clone()), ReadStep::data(vec![0x42; 6])]).await;

    assert!(run.observer.errors(DIR).is_empty());
    assert_eq!(run.observer.packets(DIR)[0].payload_len(), 6);
    assert_eq!(&run.sink.written()[..8], &header[..]);
}

#[tokio::test]
async fn test_write_error_reported_after_packet() {
    let run = relay_with(
        vec![ReadStep::data(frame(0x01, 0x01, b"lost"))],
        ScriptedEndpoint::new([ReadStep::Closed]).failing_writes(std::io::ErrorKind::BrokenPipe),
        BridgeConfig::default(),
    )
    .await;

    assert_eq!(run.observer.packets(DIR).len(), 1);
    assert_eq!(run.observer.errors(DIR), vec![ObservedError::Transport]);
    assert_eq!(run.observer.closures(DIR), vec![CloseReason::Error]);
    assert_eq!(run.summary.stats.bytes_forwarded, 0);
}

/// Forwards everything to a [`RecordingObserver`] but panics on packets.
struct PanicsOnPacket(RecordingObserver);

impl BridgeObserver for PanicsOnPacket {
    fn on_packet(&self, _: &ConnectionInfo, _: Direction, _: &Packet) {
        panic!("observer bug");
    }

    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        self.0.on_error(conn, direction, error);
    }

    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        self.0.on_direction_closed(conn, direction, reason);
    }
}

#[tokio::test]
async fn test_observer_panic_closes_direction_once() {
    let (reader, _) = ScriptedEndpoint::new([ReadStep::data(frame(0x01, 0x01, b"x"))]).split();
    let sink = ScriptedEndpoint::new([ReadStep::Closed]);
    let sink_handle = sink.handle();
    let (_, writer) = sink.split();
    let observer = Arc::new(PanicsOnPacket(RecordingObserver::new()));

    let summary = DirectionalLoop::new(
        DIR,
        reader,
        writer,
        Arc::new(ConnectionInfo::new(ConnectionId(1))),
        observer.clone(),
        &BridgeConfig::default(),
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_eq!(summary.reason, CloseReason::Error);
    assert_eq!(observer.0.errors(DIR), vec![ObservedError::ObserverPanicked]);
    assert_eq!(observer.0.closures(DIR), vec![CloseReason::Error]);
    assert_eq!(sink_handle.write_count(), 0);
    assert!(sink_handle.is_shut_down());
}

#[tokio::test]
async fn test_cancel_interrupts_back_off() {
    let (reader, _) = ScriptedEndpoint::new([ReadStep::WouldBlock]).split();
    let (_, writer) = ScriptedEndpoint::new([ReadStep::Closed]).split();
    let observer = Arc::new(RecordingObserver::new());
    let cancel = CancellationToken::new();

    let relay = DirectionalLoop::new(
        DIR,
        reader,
        writer,
        Arc::new(ConnectionInfo::new(ConnectionId(1))),
        observer.clone(),
        &BridgeConfig::new().poll_interval(Duration::from_secs(3600)),
        cancel.clone(),
    );
    let task = tokio::spawn(relay.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, CloseReason::Cancelled);
    assert_eq!(observer.closures(DIR), vec![CloseReason::Cancelled]);
    assert!(observer.errors(DIR).is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_pending_read() {
    let (reader, _) = ScriptedEndpoint::new([ReadStep::Pending]).split();
    let (_, writer) = ScriptedEndpoint::new([ReadStep::Closed]).split();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = DirectionalLoop::new(
        DIR,
        reader,
        writer,
        Arc::new(ConnectionInfo::new(ConnectionId(1))),
        Arc::new(RecordingObserver::new()),
        &BridgeConfig::default(),
        cancel,
    )
    .run()
    .await;

    assert_eq!(summary.reason, CloseReason::Cancelled);
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone)]
struct FrameSpec {
    packet_type: u8,
    status: u8,
    /// Only used by unframed frames.
    declared: u16,
    payload: Vec<u8>,
}

impl FrameSpec {
    fn is_unframed(&self) -> bool {
        self.packet_type == PacketType::UNFRAMED_CODE
    }

    fn wire(&self) -> Vec<u8> {
        if self.is_unframed() {
            frame_with_length(self.packet_type, self.status, self.declared, &self.payload)
        } else {
            frame(self.packet_type, self.status, &self.payload)
        }
    }
}

fn frame_spec() -> impl Strategy<Value = FrameSpec> {
    (
        prop_oneof![
            Just(PacketType::UNFRAMED_CODE),
            Just(0x01u8),
            Just(0x04u8),
            any::<u8>(),
        ],
        any::<u8>(),
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 1..200),
    )
        .prop_map(|(packet_type, status, declared, payload)| FrameSpec {
            packet_type,
            status,
            declared,
            payload,
        })
}

/// Lay `frames` out as read steps of at most `chunk` bytes.
///
/// An unframed payload is only delimited by the read that returns it, so it
/// is always delivered as a step of its own.
fn script(frames: &[FrameSpec], chunk: usize) -> Vec<ReadStep> {
    fn flush(pending: &mut Vec<u8>, chunk: usize, steps: &mut Vec<ReadStep>) {
        steps.extend(pending.chunks(chunk).map(|c| ReadStep::data(c.to_vec())));
        pending.clear();
    }

    let mut steps = Vec::new();
    let mut pending = Vec::new();
    for spec in frames {
        if spec.is_unframed() {
            pending.extend(frame_with_length(
                spec.packet_type,
                spec.status,
                spec.declared,
                &[],
            ));
            flush(&mut pending, chunk, &mut steps);
            steps.push(ReadStep::data(spec.payload.clone()));
        } else {
            pending.extend(spec.wire());
        }
    }
    flush(&mut pending, chunk, &mut steps);
    steps
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_relay_is_transparent_and_groups_messages(
        frames in prop::collection::vec(frame_spec(), 0..12),
        chunk in 1usize..64,
    ) {
        let input: Vec<u8> = frames.iter().flat_map(FrameSpec::wire).collect();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let run = runtime.block_on(relay(script(&frames, chunk)));

        prop_assert_eq!(run.sink.written(), input.clone());
        prop_assert_eq!(run.summary.stats.bytes_forwarded, input.len() as u64);
        prop_assert!(run.observer.errors(DIR).is_empty());
        prop_assert_eq!(run.observer.closures(DIR), vec![CloseReason::EndOfStream]);

        let packets = run.observer.packets(DIR);
        prop_assert_eq!(packets.len(), frames.len());
        for (packet, spec) in packets.iter().zip(&frames) {
            prop_assert_eq!(&packet.to_wire()[..], &spec.wire()[..]);
        }

        // every message ends on the first frame carrying END_OF_MESSAGE;
        // trailing frames without one are never delivered
        let mut expected = Vec::new();
        let mut current = Vec::new();
        for spec in &frames {
            current.push(spec.wire());
            if spec.status & 0x01 != 0 {
                expected.push(std::mem::take(&mut current));
            }
        }

        let messages = run.observer.messages(DIR);
        prop_assert_eq!(messages.len(), expected.len());
        for (message, wires) in messages.iter().zip(&expected) {
            let got: Vec<Vec<u8>> = message.packets().iter().map(|p| p.to_wire().to_vec()).collect();
            prop_assert_eq!(&got, wires);
        }
    }
}
