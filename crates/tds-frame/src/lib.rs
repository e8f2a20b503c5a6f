//! # tds-frame
//!
//! Frame header codec for the TDS (Tabular Data Stream) wire protocol, as
//! observed by the `tds-bridge` relay.
//!
//! Every TDS frame starts with an 8-byte header carrying the frame type,
//! status flags, the total frame length (header included), the session id,
//! a sequence number and a window byte. Multi-byte fields are big-endian.
//!
//! ## Design Philosophy
//!
//! This crate is IO-agnostic. It decodes and encodes headers and nothing
//! else; reading frames off a socket is the relay's job.
//!
//! Decoding is lossless: encoding a decoded header reproduces the same 8
//! bytes. Unknown frame types and unknown status bits are carried through
//! rather than rejected, since a relay must not refuse traffic it merely
//! fails to recognise. The one thing rejected is a length-delimited frame
//! whose declared length is shorter than its header.
//!
//! ## Example
//!
//! ```rust
//! use tds_frame::{PacketHeader, PacketStatus, PacketType};
//!
//! let bytes = [0x01, 0x01, 0x00, 0x10, 0x00, 0x00, 0x01, 0x00];
//! let header = PacketHeader::decode(&mut &bytes[..]).unwrap();
//!
//! assert_eq!(header.packet_type, PacketType::SqlBatch);
//! assert!(header.status.contains(PacketStatus::END_OF_MESSAGE));
//! assert_eq!(header.payload_length(), 8);
//! assert_eq!(header.to_array(), bytes);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod packet;

pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
