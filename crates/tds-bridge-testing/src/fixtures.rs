//! Frame fixtures.

use tds_frame::{PACKET_HEADER_SIZE, PacketStatus, PacketType};

/// Build a frame whose header declares exactly its own size.
#[must_use]
pub fn frame(packet_type: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let length = u16::try_from(PACKET_HEADER_SIZE + payload.len()).unwrap_or(u16::MAX);
    frame_with_length(packet_type, status, length, payload)
}

/// Build a frame with an arbitrary declared length.
///
/// Useful for unframed (`0x17`) frames, whose length field does not describe
/// the bytes that follow.
#[must_use]
pub fn frame_with_length(packet_type: u8, status: u8, length: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
    out.push(packet_type);
    out.push(status);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]); // spid
    out.push(1); // packet_id
    out.push(0); // window
    out.extend_from_slice(payload);
    out
}

/// Split `payload` into frames of at most `max_payload` bytes, marking the
/// last one `END_OF_MESSAGE`.
#[must_use]
pub fn message(packet_type: PacketType, payload: &[u8], max_payload: usize) -> Vec<u8> {
    let max_payload = max_payload.max(1);
    let mut chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let last = chunks.len() - 1;
    let mut out = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let status = if i == last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let mut bytes = frame(packet_type.as_u8(), status.bits(), chunk);
        bytes[6] = (i + 1) as u8;
        out.extend(bytes);
    }
    out
}

/// A single-frame SQL batch carrying `sql` as raw bytes.
#[must_use]
pub fn sql_batch(sql: &str) -> Vec<u8> {
    frame(
        PacketType::SqlBatch.as_u8(),
        PacketStatus::END_OF_MESSAGE.bits(),
        sql.as_bytes(),
    )
}
