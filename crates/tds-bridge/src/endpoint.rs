//! Byte-stream endpoints bridged by a connection.
//!
//! An [`Endpoint`] is one live side of a bridged connection. The relay splits
//! each endpoint into a read half and a write half: the read half belongs to
//! the directional loop that drains it, the write half to the loop that
//! forwards into it. The two loops therefore never share a half.
//!
//! Reads report a [`ReadOutcome`] instead of a bare byte count, so that
//! "no data yet" on a polling endpoint cannot be confused with end-of-stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Result of a single endpoint read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n > 0` bytes were placed at the start of the buffer.
    Data(usize),
    /// The peer closed its side (zero-length read).
    Closed,
    /// No data is available right now; retry later.
    WouldBlock,
    /// The read failed.
    Error(io::Error),
}

impl ReadOutcome {
    /// Classify the result of a raw I/O read.
    #[must_use]
    pub fn from_io(result: io::Result<usize>) -> Self {
        match result {
            Ok(0) => Self::Closed,
            Ok(n) => Self::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Self::WouldBlock,
            Err(e) => Self::Error(e),
        }
    }
}

/// Read half of an endpoint.
#[async_trait]
pub trait EndpointReader: Send + 'static {
    /// Read up to `buf.len()` bytes. `buf` is never empty.
    async fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;
}

/// Write half of an endpoint.
#[async_trait]
pub trait EndpointWriter: Send + 'static {
    /// Write the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Whether the write side is still open.
    fn is_connected(&self) -> bool;

    /// Orderly half-close of the write side.
    ///
    /// The peer observes end-of-stream. Calling this more than once is a
    /// no-op.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// A live byte-stream endpoint that can be split for duplex relaying.
pub trait Endpoint: Send + 'static {
    /// Read half type.
    type Reader: EndpointReader;
    /// Write half type.
    type Writer: EndpointWriter;

    /// Split the endpoint into independently owned halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Traffic direction of a bridged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to backend (ingress).
    ClientToBackend,
    /// Backend to client (egress).
    BackendToClient,
}

impl Direction {
    /// Both directions, ingress first.
    pub const ALL: [Direction; 2] = [Direction::ClientToBackend, Direction::BackendToClient];

    /// The opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::ClientToBackend => Self::BackendToClient,
            Self::BackendToClient => Self::ClientToBackend,
        }
    }

    /// Short label used in logs and recordings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientToBackend => "client->backend",
            Self::BackendToClient => "backend->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two endpoints of one bridged connection.
#[derive(Debug)]
pub struct ChannelPair<C, B> {
    /// Client-facing endpoint.
    pub client: C,
    /// Backend-facing endpoint.
    pub backend: B,
}

impl<C, B> ChannelPair<C, B>
where
    C: Endpoint,
    B: Endpoint,
{
    /// Pair a client-facing endpoint with a backend-facing one.
    pub fn new(client: C, backend: B) -> Self {
        Self { client, backend }
    }
}

// =============================================================================
// Stream-backed halves
// =============================================================================

/// Read half over any tokio reader. Reads wait for data.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> EndpointReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        ReadOutcome::from_io(self.inner.read(buf).await)
    }
}

impl<R> fmt::Debug for StreamReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader").finish_non_exhaustive()
    }
}

/// Write half over any tokio writer.
pub struct StreamWriter<W> {
    inner: W,
    connected: bool,
}

impl<W> StreamWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            connected: true,
        }
    }
}

#[async_trait]
impl<W> EndpointWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let result = async {
            self.inner.write_all(buf).await?;
            self.inner.flush().await
        }
        .await;
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.inner.shutdown().await
    }
}

impl<W> fmt::Debug for StreamWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Endpoint over any tokio byte stream, such as an in-memory duplex pipe.
#[derive(Debug)]
pub struct StreamEndpoint<T> {
    inner: T,
}

impl<T> StreamEndpoint<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> Endpoint for StreamEndpoint<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = StreamReader<ReadHalf<T>>;
    type Writer = StreamWriter<WriteHalf<T>>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read_half, write_half) = tokio::io::split(self.inner);
        (StreamReader::new(read_half), StreamWriter::new(write_half))
    }
}

/// TCP endpoint whose reads wait for data.
#[derive(Debug)]
pub struct TcpEndpoint {
    stream: TcpStream,
}

impl TcpEndpoint {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Remote address of the socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Endpoint for TcpEndpoint {
    type Reader = StreamReader<OwnedReadHalf>;
    type Writer = StreamWriter<OwnedWriteHalf>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read_half, write_half) = self.stream.into_split();
        (StreamReader::new(read_half), StreamWriter::new(write_half))
    }
}

/// TCP endpoint whose reads never wait.
///
/// An empty receive queue is reported as [`ReadOutcome::WouldBlock`]; the
/// relay backs off and retries.
#[derive(Debug)]
pub struct PollingTcpEndpoint {
    stream: TcpStream,
}

impl PollingTcpEndpoint {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Remote address of the socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Endpoint for PollingTcpEndpoint {
    type Reader = PollingReader;
    type Writer = StreamWriter<OwnedWriteHalf>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read_half, write_half) = self.stream.into_split();
        (PollingReader { inner: read_half }, StreamWriter::new(write_half))
    }
}

/// Non-blocking read half of a [`PollingTcpEndpoint`].
#[derive(Debug)]
pub struct PollingReader {
    inner: OwnedReadHalf,
}

#[async_trait]
impl EndpointReader for PollingReader {
    async fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        ReadOutcome::from_io(self.inner.try_read(buf))
    }
}

/// Either endpoint flavour, chosen at runtime.
#[derive(Debug)]
pub enum TcpBackend {
    /// Reads wait for data.
    Blocking(TcpEndpoint),
    /// Reads poll.
    Polling(PollingTcpEndpoint),
}

/// Read half of a [`TcpBackend`].
#[derive(Debug)]
pub enum TcpBackendReader {
    /// Waiting reads.
    Blocking(StreamReader<OwnedReadHalf>),
    /// Polling reads.
    Polling(PollingReader),
}

#[async_trait]
impl EndpointReader for TcpBackendReader {
    async fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            Self::Blocking(reader) => reader.read(buf).await,
            Self::Polling(reader) => reader.read(buf).await,
        }
    }
}

impl Endpoint for TcpBackend {
    type Reader = TcpBackendReader;
    type Writer = StreamWriter<OwnedWriteHalf>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        match self {
            Self::Blocking(endpoint) => {
                let (reader, writer) = endpoint.split();
                (TcpBackendReader::Blocking(reader), writer)
            }
            Self::Polling(endpoint) => {
                let (reader, writer) = endpoint.split();
                (TcpBackendReader::Polling(reader), writer)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_read_outcome_from_io() {
        assert!(matches!(ReadOutcome::from_io(Ok(0)), ReadOutcome::Closed));
        assert!(matches!(ReadOutcome::from_io(Ok(7)), ReadOutcome::Data(7)));
        assert!(matches!(
            ReadOutcome::from_io(Err(io::ErrorKind::WouldBlock.into())),
            ReadOutcome::WouldBlock
        ));
        assert!(matches!(
            ReadOutcome::from_io(Err(io::ErrorKind::ConnectionReset.into())),
            ReadOutcome::Error(_)
        ));
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(
            Direction::ClientToBackend.reverse(),
            Direction::BackendToClient
        );
        assert_eq!(Direction::BackendToClient.to_string(), "backend->client");
    }

    #[tokio::test]
    async fn test_stream_endpoint_relays_and_half_closes() {
        let (near, far) = tokio::io::duplex(64);
        let (mut near_reader, mut near_writer) = StreamEndpoint::new(near).split();
        let (mut far_reader, mut far_writer) = StreamEndpoint::new(far).split();

        near_writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(far_reader.read(&mut buf).await, ReadOutcome::Data(4)));
        assert_eq!(&buf[..4], b"ping");

        far_writer.shutdown().await.unwrap();
        assert!(!far_writer.is_connected());
        assert!(matches!(near_reader.read(&mut buf).await, ReadOutcome::Closed));

        // second shutdown is a no-op
        far_writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_reader_reports_would_block() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (mut reader, _writer) = PollingTcpEndpoint::new(server).split();
        let mut buf = [0u8; 8];
        assert!(matches!(reader.read(&mut buf).await, ReadOutcome::WouldBlock));
        drop(client);
    }
}
