use crate::prelude::*;
use crate::sermatec::frame::{self, FrameHeader, SIGNATURE};

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Splits the inverter byte stream into whole frames using the length byte.
///
/// Bytes ahead of a signature are dropped. Frames are returned exactly as
/// received; envelope integrity is checked separately.
#[derive(Default)]
pub struct FrameDecoder {}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {}
    }

    // drop everything in front of the first signature, keeping a trailing
    // half-signature byte in case the rest is still in flight
    fn resync(src: &mut BytesMut) {
        match src.windows(2).position(|w| w == SIGNATURE) {
            Some(0) => {}
            Some(pos) => {
                warn!("discarding {} bytes ahead of frame signature", pos);
                src.advance(pos);
            }
            None => {
                let keep = usize::from(src.last() == Some(&SIGNATURE[0]));
                let drop = src.len() - keep;
                if drop > 0 {
                    warn!("discarding {} bytes without frame signature", drop);
                    src.advance(drop);
                }
            }
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Self::resync(src);

        let header = match FrameHeader::parse(&src[..]) {
            Ok((_, header)) => header,
            // waiting on more header bytes
            Err(_) => return Ok(None),
        };

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        debug!("RX {}", frame::hex(&frame));

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sermatec::frame::FrameFactory;

    #[test]
    fn splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        let a = FrameFactory::build_reply(0x95, &[1, 2, 3]).unwrap();
        let b = FrameFactory::build_reply(0x9d, &[4]).unwrap();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), Bytes::from(a));
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), Bytes::from(b));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn waits_for_partial_frame() {
        let full = FrameFactory::build_reply(0x0a, &[0; 10]).unwrap();
        let mut buf = BytesMut::from(&full[..5]);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[5..12]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[12..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), Bytes::from(full));
    }

    #[test]
    fn skips_leading_garbage() {
        let full = FrameFactory::build_reply(0x98, &[7]).unwrap();
        let mut buf = BytesMut::from(&[0x00, 0x11, 0xfe][..]);
        buf.extend_from_slice(&full);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), Bytes::from(full));
    }
}
