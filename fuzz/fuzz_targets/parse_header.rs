#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_frame::{PACKET_HEADER_SIZE, PacketHeader, ProtocolError};

fuzz_target!(|data: &[u8]| {
    let mut cursor = data;
    match PacketHeader::decode(&mut cursor) {
        Ok(header) => {
            // decoding is lossless
            assert_eq!(&header.to_array()[..], &data[..PACKET_HEADER_SIZE]);
            assert_eq!(cursor.len(), data.len() - PACKET_HEADER_SIZE);
        }
        Err(ProtocolError::InvalidLength { length, .. }) => {
            assert!(usize::from(length) < PACKET_HEADER_SIZE);
        }
        Err(_) => assert!(data.len() < PACKET_HEADER_SIZE),
    }
});
