#![no_main]

use arbitrary::Arbitrary;
use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use pgwire_protocol::BackendMessage;

#[derive(Debug, Arbitrary)]
struct FuzzMessage {
    tag: u8,
    body: Vec<u8>,
}

fuzz_target!(|input: FuzzMessage| {
    // Anything that decodes must re-encode to a frame that decodes the same way.
    if let Ok(msg) = BackendMessage::decode(input.tag, Bytes::from(input.body)) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        if buf.len() >= 5 {
            let tag = buf[0];
            let body = buf.split_off(5).freeze();
            let _ = BackendMessage::decode(tag, body);
        }
    }
});
