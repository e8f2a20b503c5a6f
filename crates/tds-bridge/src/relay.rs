//! The directional relay loop.
//!
//! Each bridged connection runs two of these, one per direction. A loop
//! reads one frame at a time from its source endpoint, reports it, folds it
//! into the current logical message and forwards the exact bytes it read to
//! the opposite endpoint:
//!
//! ```text
//! AwaitingHeader -> ReadingPayload -> DispatchAndForward -> AwaitingHeader
//!        |                |                   |
//!        +----------------+-------------------+--> Closed
//! ```
//!
//! Payload sizing follows the header's declared length, except for
//! unframed (`0x17`) frames: after their header a single read of at most
//! `unframed_chunk_size` bytes is issued and exactly what it returned is
//! forwarded, whatever the length field says.
//!
//! A loop never stops the opposite direction. Joint teardown is the
//! connection supervisor's job.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tds_frame::{PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::BridgeConfig;
use crate::endpoint::{Direction, EndpointReader, EndpointWriter, ReadOutcome};
use crate::error::{BridgeError, CloseReason};
use crate::message::MessageAssembler;
use crate::observer::{BridgeObserver, ConnectionInfo};
use crate::packet::Packet;

/// Counters kept by one directional loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    /// Frames read and reported.
    pub packets: u64,
    /// Logical messages sealed.
    pub messages: u64,
    /// Bytes written to the opposite endpoint.
    pub bytes_forwarded: u64,
}

/// How one direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionSummary {
    /// The direction.
    pub direction: Direction,
    /// Why it stopped.
    pub reason: CloseReason,
    /// What it relayed.
    pub stats: DirectionStats,
}

impl DirectionSummary {
    /// Summary for a direction whose task died without reporting.
    #[must_use]
    pub fn failed(direction: Direction) -> Self {
        Self {
            direction,
            reason: CloseReason::Error,
            stats: DirectionStats::default(),
        }
    }
}

/// Result of a single read after `WouldBlock` retries.
enum Chunk {
    Data(usize),
    Closed,
    Cancelled,
}

/// Result of reading an exact number of bytes.
enum Fill {
    Complete,
    Closed(usize),
    Cancelled,
}

/// Whether the loop may keep going after a step.
enum Flow {
    Continue,
    Cancelled,
}

/// Relays one direction of a bridged connection.
pub struct DirectionalLoop<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    info: Arc<ConnectionInfo>,
    observer: Arc<dyn BridgeObserver>,
    poll_interval: Duration,
    min_buffer_size: usize,
    unframed_chunk_size: usize,
    cancel: CancellationToken,
    /// Payload scratch space; grows, never shrinks.
    scratch: Vec<u8>,
    assembler: MessageAssembler,
    stats: DirectionStats,
}

impl<R, W> DirectionalLoop<R, W>
where
    R: EndpointReader,
    W: EndpointWriter,
{
    /// Create a loop reading `source` and forwarding into `sink`.
    pub fn new(
        direction: Direction,
        source: R,
        sink: W,
        info: Arc<ConnectionInfo>,
        observer: Arc<dyn BridgeObserver>,
        config: &BridgeConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            direction,
            source,
            sink,
            info,
            observer,
            poll_interval: config.poll_interval,
            min_buffer_size: config.min_buffer_size,
            // an empty read buffer would look like end-of-stream
            unframed_chunk_size: config.unframed_chunk_size.max(1),
            cancel,
            scratch: Vec::new(),
            assembler: MessageAssembler::new(),
            stats: DirectionStats::default(),
        }
    }

    /// Run until end-of-stream, error or cancellation.
    ///
    /// Reports at most one error and exactly one closure to the observer,
    /// then half-closes the sink so the opposite peer sees end-of-stream.
    ///
    /// A panicking observer ends the direction with
    /// [`BridgeError::ObserverPanicked`] instead of unwinding the task.
    pub async fn run(mut self) -> DirectionSummary {
        let span = tracing::debug_span!(
            "relay",
            connection = %self.info.id,
            direction = %self.direction,
        );

        async move {
            tracing::debug!("direction started");

            let reason = match self.relay_frames().await {
                Ok(reason) => reason,
                Err(error) => {
                    tracing::debug!(%error, "direction failed");
                    if let Err(e) = self.notify("on_error", |o, info, dir| o.on_error(info, dir, &error)) {
                        tracing::error!(error = %e, "observer failed while reporting an error");
                    }
                    CloseReason::Error
                }
            };

            let dropped = self.assembler.clear();
            if dropped > 0 {
                tracing::debug!(packets = dropped, "discarding unsealed message");
            }

            if let Err(e) = self.notify("on_direction_closed", |o, info, dir| {
                o.on_direction_closed(info, dir, reason);
            }) {
                tracing::error!(error = %e, "observer failed while reporting closure");
            }

            if self.sink.is_connected() {
                if let Err(e) = self.sink.shutdown().await {
                    tracing::debug!(error = %e, "half-close failed");
                }
            }

            tracing::debug!(
                %reason,
                packets = self.stats.packets,
                messages = self.stats.messages,
                bytes = self.stats.bytes_forwarded,
                "direction closed"
            );

            DirectionSummary {
                direction: self.direction,
                reason,
                stats: self.stats,
            }
        }
        .instrument(span)
        .await
    }

    async fn relay_frames(&mut self) -> Result<CloseReason, BridgeError> {
        let mut raw_header = [0u8; PACKET_HEADER_SIZE];

        loop {
            match fill_exact(
                &mut self.source,
                &mut raw_header,
                &self.cancel,
                self.poll_interval,
            )
            .await?
            {
                Fill::Complete => {}
                Fill::Closed(0) => return Ok(CloseReason::EndOfStream),
                Fill::Closed(read) => {
                    return self.flush_truncated(&raw_header[..read], &[]).await;
                }
                Fill::Cancelled => return Ok(CloseReason::Cancelled),
            }

            let header = PacketHeader::decode(&mut &raw_header[..])?;

            let wanted = self
                .min_buffer_size
                .max(usize::from(header.length) + 1)
                .max(self.unframed_chunk_size);
            if self.scratch.len() < wanted {
                self.scratch.resize(wanted, 0);
            }

            let payload_len = if header.packet_type.reads_declared_length() {
                let declared = header.payload_length();
                if declared > 0 {
                    match fill_exact(
                        &mut self.source,
                        &mut self.scratch[..declared],
                        &self.cancel,
                        self.poll_interval,
                    )
                    .await?
                    {
                        Fill::Complete => {}
                        Fill::Closed(read) => {
                            let partial = self.scratch[..read].to_vec();
                            return self.flush_truncated(&raw_header, &partial).await;
                        }
                        Fill::Cancelled => return Ok(CloseReason::Cancelled),
                    }
                }
                declared
            } else {
                match next_chunk(
                    &mut self.source,
                    &mut self.scratch[..self.unframed_chunk_size],
                    &self.cancel,
                    self.poll_interval,
                )
                .await?
                {
                    Chunk::Data(read) => read,
                    Chunk::Closed => return self.flush_truncated(&raw_header, &[]).await,
                    Chunk::Cancelled => return Ok(CloseReason::Cancelled),
                }
            };

            let packet = Packet::new(
                raw_header,
                Bytes::copy_from_slice(&self.scratch[..payload_len]),
            );
            let wire = packet.to_wire();

            tracing::trace!(
                packet_type = ?header.packet_type,
                length = header.length,
                payload_len,
                is_eom = header.is_end_of_message(),
                "relaying frame"
            );

            self.notify("on_packet", |o, info, dir| o.on_packet(info, dir, &packet))?;
            self.stats.packets += 1;

            if let Some(message) = self.assembler.push(packet) {
                self.stats.messages += 1;
                self.notify("on_message", |o, info, dir| o.on_message(info, dir, message))?;
            }

            if let Flow::Cancelled = self.forward(&wire).await? {
                return Ok(CloseReason::Cancelled);
            }
        }
    }

    /// Invoke one observer callback, turning a panic into an error.
    fn notify<F>(&self, callback: &'static str, f: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&dyn BridgeObserver, &ConnectionInfo, Direction),
    {
        let observer = self.observer.as_ref();
        catch_unwind(AssertUnwindSafe(|| f(observer, &self.info, self.direction)))
            .map_err(|payload| BridgeError::observer_panicked(callback, payload.as_ref()))
    }

    /// Forward the bytes of a frame cut short by end-of-stream.
    async fn flush_truncated(
        &mut self,
        head: &[u8],
        tail: &[u8],
    ) -> Result<CloseReason, BridgeError> {
        let mut partial = Vec::with_capacity(head.len() + tail.len());
        partial.extend_from_slice(head);
        partial.extend_from_slice(tail);

        tracing::debug!(buffered = partial.len(), "source closed mid-frame");

        match self.forward(&partial).await? {
            Flow::Continue => Ok(CloseReason::UnexpectedClose {
                buffered: partial.len(),
            }),
            Flow::Cancelled => Ok(CloseReason::Cancelled),
        }
    }

    async fn forward(&mut self, bytes: &[u8]) -> Result<Flow, BridgeError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(Flow::Cancelled),
            result = self.sink.write_all(bytes) => {
                result?;
                self.stats.bytes_forwarded += bytes.len() as u64;
                Ok(Flow::Continue)
            }
        }
    }
}

impl<R, W> std::fmt::Debug for DirectionalLoop<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionalLoop")
            .field("connection", &self.info.id)
            .field("direction", &self.direction)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Issue one read, backing off and retrying while the source reports
/// `WouldBlock`.
async fn next_chunk<R: EndpointReader>(
    source: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> io::Result<Chunk> {
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Chunk::Cancelled),
            outcome = source.read(buf) => outcome,
        };

        match outcome {
            ReadOutcome::Data(read) => return Ok(Chunk::Data(read)),
            ReadOutcome::Closed => return Ok(Chunk::Closed),
            ReadOutcome::Error(e) => return Err(e),
            ReadOutcome::WouldBlock => {
                tracing::trace!(delay = ?poll_interval, "no data available, backing off");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(Chunk::Cancelled),
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}

/// Read exactly `buf.len()` bytes, looping over short reads.
async fn fill_exact<R: EndpointReader>(
    source: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match next_chunk(source, &mut buf[filled..], cancel, poll_interval).await? {
            Chunk::Data(read) => filled += read,
            Chunk::Closed => return Ok(Fill::Closed(filled)),
            Chunk::Cancelled => return Ok(Fill::Cancelled),
        }
    }
    Ok(Fill::Complete)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, StreamEndpoint};
    use crate::observer::{ConnectionId, NoopObserver};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(packet_type: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let length = (PACKET_HEADER_SIZE + payload.len()) as u16;
        let mut out = vec![packet_type, status];
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&[0, 0, 1, 0]);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_loop_forwards_verbatim_over_duplex() {
        let (mut client, proxy_client) = tokio::io::duplex(1024);
        let (proxy_backend, mut backend) = tokio::io::duplex(1024);

        let (source, _) = StreamEndpoint::new(proxy_client).split();
        let (_, sink) = StreamEndpoint::new(proxy_backend).split();

        let relay = DirectionalLoop::new(
            Direction::ClientToBackend,
            source,
            sink,
            Arc::new(ConnectionInfo::new(ConnectionId(1))),
            Arc::new(NoopObserver),
            &BridgeConfig::default(),
            CancellationToken::new(),
        );
        let task = tokio::spawn(relay.run());

        let mut input = frame(0x01, 0x00, b"SELECT ");
        input.extend(frame(0x01, 0x01, b"1"));
        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::EndOfStream);
        assert_eq!(summary.stats.packets, 2);
        assert_eq!(summary.stats.messages, 1);
        assert_eq!(summary.stats.bytes_forwarded, input.len() as u64);

        let mut forwarded = Vec::new();
        backend.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, input);
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let input = frame(0x12, 0x01, b"prelogin");
        let source = tokio_test::io::Builder::new()
            .read(&input[..3])
            .read(&input[3..8])
            .read(&input[8..])
            .build();
        let (proxy_backend, mut backend) = tokio::io::duplex(256);

        let (source, _) = StreamEndpoint::new(source).split();
        let (_, sink) = StreamEndpoint::new(proxy_backend).split();

        let summary = DirectionalLoop::new(
            Direction::ClientToBackend,
            source,
            sink,
            Arc::new(ConnectionInfo::new(ConnectionId(3))),
            Arc::new(NoopObserver),
            &BridgeConfig::default(),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(summary.reason, CloseReason::EndOfStream);
        assert_eq!(summary.stats.packets, 1);

        let mut forwarded = Vec::new();
        backend.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, input);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_loop() {
        let (_client, proxy_client) = tokio::io::duplex(64);
        let (proxy_backend, _backend) = tokio::io::duplex(64);
        let (source, _) = StreamEndpoint::new(proxy_client).split();
        let (_, sink) = StreamEndpoint::new(proxy_backend).split();

        let cancel = CancellationToken::new();
        let relay = DirectionalLoop::new(
            Direction::BackendToClient,
            source,
            sink,
            Arc::new(ConnectionInfo::new(ConnectionId(2))),
            Arc::new(NoopObserver),
            &BridgeConfig::default(),
            cancel.clone(),
        );
        let task = tokio::spawn(relay.run());

        cancel.cancel();
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Cancelled);
        assert_eq!(summary.stats, DirectionStats::default());
    }
}
