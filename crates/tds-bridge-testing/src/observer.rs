//! Observer that records relay events for assertions.

use parking_lot::Mutex;
use tds_bridge::{
    BridgeError, BridgeObserver, CloseReason, ConnectionId, ConnectionInfo, Direction, Message,
    Packet,
};
use tokio::sync::watch;

/// Classified copy of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedError {
    /// [`BridgeError::MalformedHeader`].
    MalformedHeader,
    /// Any transport failure.
    Transport,
    /// [`BridgeError::ObserverPanicked`].
    ObserverPanicked,
    /// Anything else.
    Other,
}

impl From<&BridgeError> for ObservedError {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::MalformedHeader(_) => Self::MalformedHeader,
            BridgeError::ObserverPanicked { .. } => Self::ObserverPanicked,
            e if e.is_transport() => Self::Transport,
            _ => Self::Other,
        }
    }
}

/// A recorded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    /// `on_packet`.
    Packet {
        /// Connection.
        connection: ConnectionId,
        /// Direction.
        direction: Direction,
        /// The frame.
        packet: Packet,
    },
    /// `on_message`.
    Message {
        /// Connection.
        connection: ConnectionId,
        /// Direction.
        direction: Direction,
        /// The sealed message.
        message: Message,
    },
    /// `on_error`.
    Error {
        /// Connection.
        connection: ConnectionId,
        /// Direction.
        direction: Direction,
        /// Error class.
        error: ObservedError,
    },
    /// `on_direction_closed`.
    Closed {
        /// Connection.
        connection: ConnectionId,
        /// Direction.
        direction: Direction,
        /// Close reason.
        reason: CloseReason,
    },
}

impl ObservedEvent {
    /// Direction the event belongs to.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Packet { direction, .. }
            | Self::Message { direction, .. }
            | Self::Error { direction, .. }
            | Self::Closed { direction, .. } => *direction,
        }
    }
}

/// Observer that keeps every event in arrival order.
#[derive(Debug)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
    closures: watch::Sender<usize>,
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        let (closures, _) = watch::channel(0);
        Self {
            events: Mutex::new(Vec::new()),
            closures,
        }
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Events of one direction.
    #[must_use]
    pub fn events_for(&self, direction: Direction) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.direction() == direction)
            .cloned()
            .collect()
    }

    /// Packets reported for one direction.
    #[must_use]
    pub fn packets(&self, direction: Direction) -> Vec<Packet> {
        self.events_for(direction)
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Packet { packet, .. } => Some(packet),
                _ => None,
            })
            .collect()
    }

    /// Messages reported for one direction.
    #[must_use]
    pub fn messages(&self, direction: Direction) -> Vec<Message> {
        self.events_for(direction)
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Message { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Errors reported for one direction.
    #[must_use]
    pub fn errors(&self, direction: Direction) -> Vec<ObservedError> {
        self.events_for(direction)
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Error { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }

    /// Close reasons reported for one direction.
    #[must_use]
    pub fn closures(&self, direction: Direction) -> Vec<CloseReason> {
        self.events_for(direction)
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Closed { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` direction closures have been reported.
    pub async fn wait_for_closures(&self, count: usize) {
        let mut rx = self.closures.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl BridgeObserver for RecordingObserver {
    fn on_packet(&self, conn: &ConnectionInfo, direction: Direction, packet: &Packet) {
        self.push(ObservedEvent::Packet {
            connection: conn.id,
            direction,
            packet: packet.clone(),
        });
    }

    fn on_message(&self, conn: &ConnectionInfo, direction: Direction, message: Message) {
        self.push(ObservedEvent::Message {
            connection: conn.id,
            direction,
            message,
        });
    }

    fn on_error(&self, conn: &ConnectionInfo, direction: Direction, error: &BridgeError) {
        self.push(ObservedEvent::Error {
            connection: conn.id,
            direction,
            error: ObservedError::from(error),
        });
    }

    fn on_direction_closed(&self, conn: &ConnectionInfo, direction: Direction, reason: CloseReason) {
        self.push(ObservedEvent::Closed {
            connection: conn.id,
            direction,
            reason,
        });
        self.closures.send_modify(|seen| *seen += 1);
    }
}
