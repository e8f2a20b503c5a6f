//! Observer contract for relay events.
//!
//! Every directional loop reports what it sees to a [`BridgeObserver`]. The
//! callbacks run synchronously on the loop that produced the event, so they
//! may be invoked concurrently from both directions of one connection and
//! from many connections at once. They must not block for long: the loop
//! does not forward the frame until the callbacks return.
//!
//! Per terminal condition of a direction the observer sees at most one
//! [`on_error`](BridgeObserver::on_error), followed by exactly one
//! [`on_direction_closed`](BridgeObserver::on_direction_closed).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::endpoint::Direction;
use crate::error::{BridgeError, CloseReason};
use crate::message::Message;
use crate::packet::Packet;

/// Identifier of a bridged connection, assigned by whoever creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a bridged connection, passed to every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Client address, when known.
    pub client_addr: Option<SocketAddr>,
    /// Backend address, when known.
    pub backend_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// Create connection info without addresses.
    #[must_use]
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            client_addr: None,
            backend_addr: None,
        }
    }

    /// Set the client address.
    #[must_use]
    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Set the backend address.
    #[must_use]
    pub fn with_backend_addr(mut self, addr: SocketAddr) -> Self {
        self.backend_addr = Some(addr);
        self
    }
}

/// Receiver of relay events.
///
/// All methods default to doing nothing, so observers implement only the
/// granularity they care about.
pub trait BridgeObserver: Send + Sync {
    /// A frame was read. Called before the frame is folded into its message,
    /// so the packet may belong to a message that is not sealed yet.
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        let _ = (conn, direction, packet);
    }

    /// A frame carrying `END_OF_MESSAGE` sealed a logical message.
    fn on_message(&self, conn: &ConnectionInfo, direction: Direction, message: Message) {
        let _ = (conn, direction, message);
    }

    /// A read, decode or write failed. The direction closes next.
    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        let _ = (conn, direction, error);
    }

    /// The direction stopped for good.
    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        let _ = (conn, direction, reason);
    }
}

impl<T: BridgeObserver + ?Sized> BridgeObserver for Arc<T> {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        (**self).on_packet(conn, direction, packet);
    }

    fn on_message(&self, conn: &ConnectionInfo, direction: Direction, message: Message) {
        (**self).on_message(conn, direction, message);
    }

    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        (**self).on_error(conn, direction, error);
    }

    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        (**self).on_direction_closed(conn, direction, reason);
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BridgeObserver for NoopObserver {}

/// Observer that emits a `tracing` event for everything it sees.
///
/// Frames are logged at `TRACE`, messages at `DEBUG`, errors at `WARN` and
/// closures at `INFO`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        tracing::trace!(
            connection = %conn.id,
            %direction,
            packet_type = ?packet.packet_type(),
            length = packet.header.length,
            payload_len = packet.payload_len(),
            packet_id = packet.header.packet_id,
            is_eom = packet.is_end_of_message(),
            "frame"
        );
    }

    fn on_message(&self, conn: &ConnectionInfo, direction: Direction, message: Message) {
        tracing::debug!(
            connection = %conn.id,
            %direction,
            packet_type = ?message.packet_type(),
            packets = message.packet_count(),
            wire_len = message.wire_len(),
            "message"
        );
    }

    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        tracing::warn!(connection = %conn.id, %direction, %error, "bridge error");
    }

    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        tracing::info!(connection = %conn.id, %direction, %reason, "direction closed");
    }
}

/// Forwards every event to several observers, in order.
#[derive(Default, Clone)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn BridgeObserver>>,
}

impl ObserverChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn BridgeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Number of observers in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for ObserverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverChain")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl BridgeObserver for ObserverChain {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        for observer in &self.observers {
            observer.on_packet(conn, direction, packet);
        }
    }

    fn on_message(&self, conn: &ConnectionInfo, direction: Direction, message: Message) {
        // the last observer takes the message by value
        if let Some((last, rest)) = self.observers.split_last() {
            for observer in rest {
                observer.on_message(conn, direction, message.clone());
            }
            last.on_message(conn, direction, message);
        }
    }

    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        for observer in &self.observers {
            observer.on_error(conn, direction, error);
        }
    }

    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        for observer in &self.observers {
            observer.on_direction_closed(conn, direction, reason);
        }
    }
}
