//! One relayed frame.

use bytes::{BufMut, Bytes, BytesMut};
use tds_frame::{PACKET_HEADER_SIZE, PacketHeader, PacketType};

/// A frame as it crossed the wire: the raw header bytes and the payload bytes
/// actually read for it.
///
/// For most frames the payload is exactly the length the header declares.
/// For [`PacketType::Unframed`] frames it is whatever a single read returned,
/// so `payload_len()` may differ from `header.payload_length()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Decoded header.
    pub header: PacketHeader,
    /// Header bytes exactly as received.
    pub raw_header: [u8; PACKET_HEADER_SIZE],
    /// Payload bytes (excluding header).
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet from the raw header window and its payload.
    #[must_use]
    pub fn new(raw_header: [u8; PACKET_HEADER_SIZE], payload: Bytes) -> Self {
        Self {
            header: PacketHeader::decode_from(&raw_header),
            raw_header,
            payload,
        }
    }

    /// Build a packet from a header value, encoding it.
    #[must_use]
    pub fn from_header(header: PacketHeader, payload: Bytes) -> Self {
        Self {
            raw_header: header.to_array(),
            header,
            payload,
        }
    }

    /// Frame type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Number of payload bytes carried.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header plus payload size.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }

    /// The exact bytes to put back on the wire.
    #[must_use]
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size());
        self.write_wire(&mut buf);
        buf.freeze()
    }

    /// Append the wire bytes to `dst`.
    pub fn write_wire(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.raw_header);
        dst.put_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_frame::PacketStatus;

    #[test]
    fn test_wire_bytes_are_verbatim() {
        let raw = [0x04, 0x01, 0x00, 0x0C, 0x00, 0x35, 0x01, 0x00];
        let packet = Packet::new(raw, Bytes::from_static(b"rows"));

        assert_eq!(packet.packet_type(), PacketType::TabularResult);
        assert!(packet.is_end_of_message());
        assert_eq!(packet.total_size(), 12);
        assert_eq!(&packet.to_wire()[..8], &raw);
        assert_eq!(&packet.to_wire()[8..], b"rows");
    }

    #[test]
    fn test_unframed_payload_may_differ_from_declared_length() {
        let header = PacketHeader::new(PacketType::Unframed, PacketStatus::NORMAL, 0x0A00);
        let packet = Packet::from_header(header, Bytes::from(vec![0xAB; 200]));

        assert_eq!(packet.payload_len(), 200);
        assert_ne!(packet.payload_len(), header.payload_length());
    }
}
