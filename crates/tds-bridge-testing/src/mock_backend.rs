//! Mock TDS backend.
//!
//! A TCP server that reads frames with [`FrameCodec`], groups them into
//! messages and answers every sealed request with the frames its responder
//! returns. The default responder echoes the request payload back in a
//! tabular-result message.
//!
//! When the client half-closes, the backend finishes its replies and
//! half-closes too.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tds_bridge::{BridgeError, FrameCodec, Message, MessageAssembler, Packet};
use tds_frame::{DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Builds the reply frames for a request message.
pub type Responder = Arc<dyn Fn(&Message) -> Vec<Packet> + Send + Sync>;

/// Reply with the request payload in a tabular-result message.
#[must_use]
pub fn echo_response(request: &Message) -> Vec<Packet> {
    let payload = request.payload();
    let max_payload = DEFAULT_PACKET_SIZE - PACKET_HEADER_SIZE;

    let mut chunks: Vec<Bytes> = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + max_payload).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    if chunks.is_empty() {
        chunks.push(Bytes::new());
    }

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let status = if i == last {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let header = PacketHeader::new(
                PacketType::TabularResult,
                status,
                (PACKET_HEADER_SIZE + chunk.len()) as u16,
            )
            .with_packet_id((i + 1) as u8);
            Packet::from_header(header, chunk)
        })
        .collect()
}

/// Builder for [`MockBackend`].
pub struct MockBackendBuilder {
    responder: Responder,
}

impl MockBackendBuilder {
    /// Create a builder with the echo responder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            responder: Arc::new(echo_response),
        }
    }

    /// Use a custom responder.
    #[must_use]
    pub fn with_responder(
        mut self,
        responder: impl Fn(&Message) -> Vec<Packet> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Bind to an ephemeral localhost port and start serving.
    pub async fn build(self) -> std::io::Result<MockBackend> {
        MockBackend::start(self.responder).await
    }
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mock backend.
pub struct MockBackend {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    connection_count: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Message>>>,
}

impl MockBackend {
    /// Create a new builder for the mock backend.
    #[must_use]
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::new()
    }

    async fn start(responder: Responder) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let connection_count = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            connection_count: connection_count.clone(),
            received: received.clone(),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer_addr)) => {
                                let responder = responder.clone();
                                let received = received.clone();
                                let count = connection_count.clone();
                                tokio::spawn(async move {
                                    count.fetch_add(1, Ordering::SeqCst);
                                    if let Err(e) = handle_connection(stream, responder, received).await {
                                        tracing::debug!(error = %e, "mock backend connection error");
                                    }
                                    count.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "mock backend accept error");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Request messages received so far, across all connections.
    #[must_use]
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(
    stream: TcpStream,
    responder: Responder,
    received: Arc<Mutex<Vec<Message>>>,
) -> Result<(), BridgeError> {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());
    let mut assembler = MessageAssembler::new();

    while let Some(packet) = frames.next().await {
        let packet = packet?;
        if let Some(message) = assembler.push(packet) {
            let replies = responder(&message);
            received.lock().push(message);
            for reply in replies {
                sink.feed(reply).await?;
            }
            sink.flush().await?;
        }
    }

    sink.close().await
}
