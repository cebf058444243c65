use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, DEFAULT_MAX_PAYLOAD};
use crate::error::FrameError;

/// `tokio_util` codec speaking the chat wire format.
///
/// Lets async clients wrap a socket in `Framed` without re-implementing the
/// length prefix. Decoding enforces the inbound payload limit; encoding does not.
#[derive(Debug, Clone)]
pub struct ChatCodec {
    max_payload_size: usize,
}

impl ChatCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for ChatCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChatCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_payload_size)
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for ChatCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item.as_ref(), dst)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn decoder_waits_for_complete_frame() {
        let mut codec = ChatCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&b"hello"[..], &mut buf).unwrap();
        let mut partial = buf.split_to(6);

        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let mut codec = ChatCodec::with_max_payload(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::PayloadTooLarge { size: 9, max: 8 })
        ));
    }
}
