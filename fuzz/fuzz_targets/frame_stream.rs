#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use pgwire_codec::PgCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = PgCodec::new().with_max_message_size(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_msg)) = codec.decode(&mut buf) {}
});
