use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Stream codec that yields frames of a fixed, adjustable length.
///
/// Stream stages know the exact size of the next message up front, so the
/// decoder simply waits until that many bytes are buffered. Anything beyond
/// stays buffered for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFrameCodec {
    frame_len: usize,
}

impl FixedFrameCodec {
    pub fn new(frame_len: usize) -> Self {
        Self { frame_len }
    }

    pub fn set_frame_len(&mut self, frame_len: usize) {
        self.frame_len = frame_len;
    }
}

impl Default for FixedFrameCodec {
    fn default() -> Self {
        Self::new(crate::types::HEADER_LEN)
    }
}

impl Decoder for FixedFrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.frame_len {
            src.reserve(self.frame_len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(self.frame_len)))
    }

    /// A partial frame at end of stream is dropped and the stream ends.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for FixedFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
