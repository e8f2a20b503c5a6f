#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tds_bridge::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // every decoded frame re-encodes to exactly the bytes it consumed
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);
    let mut consumed = 0;

    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        let wire = packet.to_wire();
        assert_eq!(&wire[..], &data[consumed..consumed + wire.len()]);
        consumed += wire.len();
    }
});
