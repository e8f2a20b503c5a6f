//! Logical message reassembly.
//!
//! A logical message spans one or more frames; the final frame carries the
//! `END_OF_MESSAGE` status flag. Unlike a client-side reassembler, the relay
//! keeps every packet intact (headers included) so observers can see the
//! exact frames that made up the exchange.

use bytes::{Bytes, BytesMut};
use tds_frame::PacketType;

use crate::packet::Packet;

/// A sealed logical message: its packets in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    packets: Vec<Packet>,
}

impl Message {
    /// Create a message holding a single packet.
    #[must_use]
    pub fn from_packet(packet: Packet) -> Self {
        Self {
            packets: vec![packet],
        }
    }

    /// The packet type of the first packet.
    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        self.packets.first().map(Packet::packet_type)
    }

    /// Packets in arrival order.
    #[must_use]
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Consume the message, returning its packets.
    #[must_use]
    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }

    /// Number of packets.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Concatenated payloads, headers stripped.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        if let [single] = self.packets.as_slice() {
            return single.payload.clone();
        }
        let mut buf = BytesMut::with_capacity(self.packets.iter().map(Packet::payload_len).sum());
        for packet in &self.packets {
            buf.extend_from_slice(&packet.payload);
        }
        buf.freeze()
    }

    /// Total bytes the message occupied on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.packets.iter().map(Packet::total_size).sum()
    }
}

/// Groups packets into logical messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    /// Packets of the message being assembled.
    pending: Vec<Packet>,
}

impl MessageAssembler {
    /// Create a new message assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a packet into the assembler.
    ///
    /// Returns `Some(Message)` if this packet completes a message,
    /// `None` if more packets are needed.
    pub fn push(&mut self, packet: Packet) -> Option<Message> {
        let is_eom = packet.is_end_of_message();
        self.pending.push(packet);

        tracing::trace!(
            packet_count = self.pending.len(),
            is_eom,
            "assembling message"
        );

        if is_eom {
            Some(Message {
                packets: std::mem::take(&mut self.pending),
            })
        } else {
            None
        }
    }

    /// Check if the assembler has a partial message buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Get the number of packets accumulated so far.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial message, returning how many packets it held.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tds_frame::{PacketHeader, PacketStatus};

    fn make_packet(is_eom: bool, payload: &'static [u8]) -> Packet {
        let status = if is_eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let header = PacketHeader::new(PacketType::TabularResult, status, 8 + payload.len() as u16);
        Packet::from_header(header, Bytes::from_static(payload))
    }

    #[test]
    fn test_single_packet_message() {
        let mut assembler = MessageAssembler::new();
        let packet = make_packet(true, b"hello");

        let message = assembler.push(packet).expect("should complete message");
        assert_eq!(message.packet_type(), Some(PacketType::TabularResult));
        assert_eq!(message.packet_count(), 1);
        assert_eq!(&message.payload()[..], b"hello");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_multi_packet_message() {
        let mut assembler = MessageAssembler::new();

        assert!(assembler.push(make_packet(false, b"hello ")).is_none());
        assert!(assembler.has_partial());
        assert_eq!(assembler.packet_count(), 1);

        assert!(assembler.push(make_packet(false, b"world")).is_none());
        assert_eq!(assembler.packet_count(), 2);

        let message = assembler
            .push(make_packet(true, b"!"))
            .expect("should complete message");

        assert_eq!(message.packet_count(), 3);
        assert_eq!(&message.packets()[1].payload[..], b"world");
        assert_eq!(&message.payload()[..], b"hello world!");
        assert_eq!(message.wire_len(), 3 * 8 + 12);
        assert!(!assembler.has_partial());
        assert_eq!(assembler.packet_count(), 0);
    }

    #[test]
    fn test_next_message_starts_empty() {
        let mut assembler = MessageAssembler::new();
        assembler.push(make_packet(true, b"one")).unwrap();

        let second = assembler.push(make_packet(true, b"two")).unwrap();
        assert_eq!(second.packet_count(), 1);
        assert_eq!(&second.payload()[..], b"two");
    }

    #[test]
    fn test_clear() {
        let mut assembler = MessageAssembler::new();

        assembler.push(make_packet(false, b"partial"));
        assert!(assembler.has_partial());

        assert_eq!(assembler.clear(), 1);
        assert!(!assembler.has_partial());
    }
}
