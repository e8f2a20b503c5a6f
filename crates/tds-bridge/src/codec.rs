//! TDS frame codec for tokio-util framing.
//!
//! The relay loop reads frames by hand so that it can honour the read
//! semantics of each endpoint. Hosts that terminate the protocol instead of
//! relaying it (test backends, replay tools) can use this codec with
//! `FramedRead` / `FramedWrite`.

use bytes::{Buf, BytesMut};
use tds_frame::{PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_UNFRAMED_CHUNK_SIZE;
use crate::error::BridgeError;
use crate::packet::Packet;

/// Frame codec.
///
/// Decoding follows the header's declared length. An unframed (`0x17`)
/// frame yields its header plus whatever payload is already buffered, capped
/// at the unframed chunk size. Encoding writes a packet's wire bytes
/// verbatim.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    unframed_chunk_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            unframed_chunk_size: DEFAULT_UNFRAMED_CHUNK_SIZE,
        }
    }

    /// Set the cap applied to unframed payloads.
    #[must_use]
    pub fn with_unframed_chunk_size(mut self, size: usize) -> Self {
        self.unframed_chunk_size = size.max(1);
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])?;

        let payload_len = if header.packet_type.reads_declared_length() {
            let payload_len = header.payload_length();
            if src.len() < PACKET_HEADER_SIZE + payload_len {
                src.reserve(PACKET_HEADER_SIZE + payload_len - src.len());
                return Ok(None);
            }
            payload_len
        } else {
            let buffered = src.len() - PACKET_HEADER_SIZE;
            if buffered == 0 {
                return Ok(None);
            }
            buffered.min(self.unframed_chunk_size)
        };

        let raw_header = header.to_array();
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = header.length,
            payload_len,
            is_eom = header.is_end_of_message(),
            "decoded TDS frame"
        );

        Ok(Some(Packet::new(raw_header, payload)))
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.total_size());
        item.write_wire(dst);
        Ok(())
    }
}
