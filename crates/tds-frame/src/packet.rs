//! TDS frame header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS frame header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Maximum TDS frame size (64KB - 1).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Default TDS frame size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS frame type.
///
/// Decoding never fails on the type byte: codes without a named variant are
/// kept verbatim in [`PacketType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch,
    /// Pre-TDS7 login packet.
    PreTds7Login,
    /// Remote procedure call.
    Rpc,
    /// Tabular response.
    TabularResult,
    /// Attention signal.
    Attention,
    /// Bulk load data.
    BulkLoad,
    /// Federated authentication token.
    FedAuthToken,
    /// Transaction manager request.
    TransactionManager,
    /// TDS7+ login packet.
    Tds7Login,
    /// SSPI authentication.
    Sspi,
    /// Pre-login packet.
    PreLogin,
    /// Frame type `0x17`.
    ///
    /// The length field of these frames is not trusted: the relay reads a
    /// single best-effort chunk after the header instead of the declared
    /// payload.
    Unframed,
    /// Any other type code.
    Other(u8),
}

impl PacketType {
    /// Raw code of [`PacketType::Unframed`].
    pub const UNFRAMED_CODE: u8 = 0x17;

    /// Create a packet type from a raw byte value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::SqlBatch,
            0x02 => Self::PreTds7Login,
            0x03 => Self::Rpc,
            0x04 => Self::TabularResult,
            0x06 => Self::Attention,
            0x07 => Self::BulkLoad,
            0x08 => Self::FedAuthToken,
            0x0E => Self::TransactionManager,
            0x10 => Self::Tds7Login,
            0x11 => Self::Sspi,
            0x12 => Self::PreLogin,
            Self::UNFRAMED_CODE => Self::Unframed,
            other => Self::Other(other),
        }
    }

    /// Raw byte value of this packet type.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::SqlBatch => 0x01,
            Self::PreTds7Login => 0x02,
            Self::Rpc => 0x03,
            Self::TabularResult => 0x04,
            Self::Attention => 0x06,
            Self::BulkLoad => 0x07,
            Self::FedAuthToken => 0x08,
            Self::TransactionManager => 0x0E,
            Self::Tds7Login => 0x10,
            Self::Sspi => 0x11,
            Self::PreLogin => 0x12,
            Self::Unframed => Self::UNFRAMED_CODE,
            Self::Other(code) => code,
        }
    }

    /// Whether the payload of this frame type is delimited by the header's
    /// length field.
    #[must_use]
    pub const fn reads_declared_length(self) -> bool {
        !matches!(self, Self::Unframed)
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.as_u8()
    }
}

bitflags! {
    /// TDS frame status flags.
    ///
    /// Bits outside the named flags are retained on decode so that a header
    /// re-encodes to exactly the bytes it was read from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Ignore this event (used for attention acknowledgment).
        const IGNORE_EVENT = 0x02;
        /// Reset connection (SQL Server 2000+).
        const RESET_CONNECTION = 0x08;
        /// Reset connection but keep transaction state.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS frame header.
///
/// Every TDS frame begins with an 8-byte header that describes the frame
/// type, status, and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of frame.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total frame length including header.
    pub length: u16,
    /// Server process ID (SPID).
    pub spid: u16,
    /// Packet sequence number (wraps at 255).
    pub packet_id: u8,
    /// Window (unused, should be 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new frame header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Parse a frame header from bytes.
    ///
    /// Fails when fewer than [`PACKET_HEADER_SIZE`] bytes remain, in which
    /// case no byte is consumed, and when a length-delimited frame declares
    /// a total length shorter than its own header. The length of an
    /// unframed (`0x17`) frame is not checked.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompleteHeader {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8());
        let status = PacketStatus::from_bits_retain(src.get_u8());
        let length = src.get_u16();
        let spid = src.get_u16();
        let packet_id = src.get_u8();
        let window = src.get_u8();

        let header = Self {
            packet_type,
            status,
            length,
            spid,
            packet_id,
            window,
        };
        header.check_length()?;
        Ok(header)
    }

    /// Check the declared length against the header size.
    ///
    /// Unframed (`0x17`) frames always pass since their length field is
    /// never used.
    pub const fn check_length(&self) -> Result<(), ProtocolError> {
        if self.packet_type.reads_declared_length()
            && (self.length as usize) < PACKET_HEADER_SIZE
        {
            return Err(ProtocolError::InvalidLength {
                length: self.length,
                minimum: PACKET_HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Parse a frame header from a complete header window.
    ///
    /// Performs no validation; see [`check_length`](Self::check_length).
    #[must_use]
    pub fn decode_from(raw: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            packet_type: PacketType::from_u8(raw[0]),
            status: PacketStatus::from_bits_retain(raw[1]),
            length: u16::from_be_bytes([raw[2], raw[3]]),
            spid: u16::from_be_bytes([raw[4], raw[5]]),
            packet_id: raw[6],
            window: raw[7],
        }
    }

    /// Encode the frame header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type.as_u8());
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Encode the frame header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Encode the frame header into a fixed-size array.
    #[must_use]
    pub fn to_array(&self) -> [u8; PACKET_HEADER_SIZE] {
        let [len_hi, len_lo] = self.length.to_be_bytes();
        let [spid_hi, spid_lo] = self.spid.to_be_bytes();
        [
            self.packet_type.as_u8(),
            self.status.bits(),
            len_hi,
            len_lo,
            spid_hi,
            spid_lo,
            self.packet_id,
            self.window,
        ]
    }

    /// Get the payload length (total length minus header).
    ///
    /// A declared length shorter than the header yields zero; such headers
    /// are rejected by [`decode`](Self::decode).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the SPID.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            packet_type: PacketType::SqlBatch,
            status: PacketStatus::END_OF_MESSAGE,
            length: PACKET_HEADER_SIZE as u16,
            spid: 0,
            packet_id: 1,
            window: 0,
        }
    }
}
