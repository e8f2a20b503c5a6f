//! Frame recording for later inspection or replay.
//!
//! [`FrameRecorder`] is an observer that keeps the wire bytes of every frame
//! it sees, tagged with connection and direction. Concatenating the frames of
//! one direction reproduces the byte stream that was forwarded.
//!
//! [`StreamingRecorder`] writes the same records to a file as frames arrive,
//! so a long-running bridge does not hold its whole history in memory.
//!
//! ## File format
//!
//! A recording is a sequence of records:
//!
//! ```text
//! connection id  u64 LE
//! direction      u8   (0 = client->backend, 1 = backend->client)
//! length         u32 LE
//! data           [u8; length]
//! ```

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::Direction;
use crate::observer::{BridgeObserver, ConnectionId, ConnectionInfo};
use crate::packet::Packet;

/// A frame captured by a [`FrameRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    /// Connection the frame belongs to.
    pub connection: ConnectionId,
    /// Direction it travelled.
    pub direction: Direction,
    /// Header and payload bytes.
    pub data: Bytes,
}

const RECORD_PREFIX: usize = 8 + 1 + 4;

fn direction_code(direction: Direction) -> u8 {
    match direction {
        Direction::ClientToBackend => 0,
        Direction::BackendToClient => 1,
    }
}

fn direction_from_code(code: u8) -> io::Result<Direction> {
    match code {
        0 => Ok(Direction::ClientToBackend),
        1 => Ok(Direction::BackendToClient),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid direction byte {other:#04x}"),
        )),
    }
}

/// Observer that records every relayed frame in memory.
#[derive(Debug, Default)]
pub struct FrameRecorder {
    frames: Mutex<Vec<RecordedFrame>>,
}

impl FrameRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded frames.
    #[must_use]
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().clone()
    }

    /// Take the recorded frames, leaving the recorder empty.
    pub fn take(&self) -> Vec<RecordedFrame> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Number of recorded frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Discard all recorded frames.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    /// The byte stream one direction of one connection forwarded.
    #[must_use]
    pub fn stream_bytes(&self, connection: ConnectionId, direction: Direction) -> Bytes {
        let frames = self.frames.lock();
        let mut out = BytesMut::new();
        for frame in frames
            .iter()
            .filter(|f| f.connection == connection && f.direction == direction)
        {
            out.extend_from_slice(&frame.data);
        }
        out.freeze()
    }

    /// Write the recording to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let encoded = encode_frames(&self.frames.lock());
        tokio::fs::write(path, encoded).await
    }

    /// Read a recording written by [`save`](Self::save).
    pub async fn load(path: impl AsRef<Path>) -> io::Result<Vec<RecordedFrame>> {
        let data = tokio::fs::read(path).await?;
        decode_frames(Bytes::from(data))
    }
}

impl BridgeObserver for FrameRecorder {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        self.frames.lock().push(RecordedFrame {
            connection: conn.id,
            direction,
            data: packet.to_wire(),
        });
    }
}

/// Default number of frames a [`StreamingRecorder`] buffers ahead of the
/// file writer.
pub const DEFAULT_RECORDER_CAPACITY: usize = 1024;

/// Observer that appends every relayed frame to a file.
///
/// Frames are handed to a writer task over a bounded channel. Observer
/// callbacks cannot wait, so when the writer falls behind by more than the
/// channel capacity further frames are dropped and counted.
#[derive(Debug)]
pub struct StreamingRecorder {
    tx: Mutex<Option<mpsc::Sender<RecordedFrame>>>,
    dropped: AtomicU64,
}

/// The file writer behind a [`StreamingRecorder`].
#[derive(Debug)]
pub struct RecordingWriter {
    task: JoinHandle<io::Result<u64>>,
}

impl StreamingRecorder {
    /// Create (or truncate) `path` and start the writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn create(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> io::Result<(Self, RecordingWriter)> {
        let file = tokio::fs::File::create(path).await?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(write_records(BufWriter::new(file), rx));

        Ok((
            Self {
                tx: Mutex::new(Some(tx)),
                dropped: AtomicU64::new(0),
            },
            RecordingWriter { task },
        ))
    }

    /// Frames that could not be queued.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop recording. Frames already queued are still written.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl BridgeObserver for StreamingRecorder {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };

        let frame = RecordedFrame {
            connection: conn.id,
            direction,
            data: packet.to_wire(),
        };
        if let Err(e) = tx.try_send(frame) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(connection = %conn.id, dropped, "recorder falling behind, frame dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!(connection = %conn.id, dropped, "recording writer stopped, frame dropped");
                }
            }
        }
    }
}

impl RecordingWriter {
    /// Wait for the writer to drain and flush, returning the number of
    /// frames written.
    ///
    /// Completes once [`StreamingRecorder::close`] was called or the
    /// recorder was dropped.
    pub async fn finish(self) -> io::Result<u64> {
        self.task.await.map_err(io::Error::other)?
    }
}

async fn write_records(
    mut out: BufWriter<tokio::fs::File>,
    mut rx: mpsc::Receiver<RecordedFrame>,
) -> io::Result<u64> {
    let mut written = 0u64;
    let mut buf = BytesMut::new();

    while let Some(frame) = rx.recv().await {
        buf.clear();
        encode_record(&mut buf, &frame);
        out.write_all(&buf).await?;
        written += 1;

        // keep the file current while the bridge is idle
        if rx.is_empty() {
            out.flush().await?;
        }
    }

    out.flush().await?;
    tracing::debug!(frames = written, "recording closed");
    Ok(written)
}

fn encode_record(buf: &mut BytesMut, frame: &RecordedFrame) {
    buf.reserve(RECORD_PREFIX + frame.data.len());
    buf.put_u64_le(frame.connection.0);
    buf.put_u8(direction_code(frame.direction));
    buf.put_u32_le(frame.data.len() as u32);
    buf.put_slice(&frame.data);
}

fn encode_frames(frames: &[RecordedFrame]) -> Bytes {
    let size = frames.iter().map(|f| RECORD_PREFIX + f.data.len()).sum();
    let mut buf = BytesMut::with_capacity(size);
    for frame in frames {
        encode_record(&mut buf, frame);
    }
    buf.freeze()
}

fn decode_frames(mut data: Bytes) -> io::Result<Vec<RecordedFrame>> {
    let mut frames = Vec::new();
    while data.has_remaining() {
        if data.remaining() < RECORD_PREFIX {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record header",
            ));
        }
        let connection = ConnectionId(data.get_u64_le());
        let direction = direction_from_code(data.get_u8())?;
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record declares {len} bytes, {} left", data.remaining()),
            ));
        }
        frames.push(RecordedFrame {
            connection,
            direction,
            data: data.split_to(len),
        });
    }
    Ok(frames)
}
