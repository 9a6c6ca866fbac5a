#![no_main]

use bytes::{BufMut, BytesMut};
use libfuzzer_sys::fuzz_target;
use wolframite::{frame::FrameCodec, Role};

fuzz_target!(|data: &[u8]| {
    let mut buffer = BytesMut::new();
    buffer.put(data);
    for role in [Role::Client, Role::Server] {
        let codec = FrameCodec::new(role, 1 << 20);
        let mut buffer = buffer.clone();
        while let Ok(Some(_frame)) = codec.unframe(&mut buffer) {}
    }
});
