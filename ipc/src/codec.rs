//! Length-prefixed term frames.
//!
//! Every message on the control channel is a 2-byte big-endian length
//! followed by one encoded term. The same codec serves both directions
//! through `FramedRead`/`FramedWrite`.

use crate::error::IpcError;
use bytes::{Buf, BufMut, BytesMut};
use schema::Term;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single outgoing frame; the 2-byte length prefix
/// cannot express more. Incoming frames are bounded by the prefix
/// itself.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Codec for the control-channel framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortCodec;

impl Decoder for PortCodec {
    type Item = Term;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Term>, IpcError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        let frame = src.split_to(len);
        let term = Term::decode(&frame)?;
        Ok(Some(term))
    }
}

impl Encoder<Term> for PortCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Term, dst: &mut BytesMut) -> Result<(), IpcError> {
        let payload = item.encode()?;
        let len =
            u16::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(payload.len()))?;
        dst.reserve(2 + payload.len());
        dst.put_u16(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(term: &Term) -> BytesMut {
        let mut buf = BytesMut::new();
        PortCodec.encode(term.clone(), &mut buf).expect("encode");
        buf
    }

    #[test]
    fn test_round_trip() {
        let term = Term::Tuple(vec![
            Term::Int(1),
            Term::Tuple(vec![Term::atom("ok"), Term::Int(4321)]),
        ]);
        let mut buf = encode_frame(&term);
        let decoded = PortCodec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, term);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let term = Term::Str("partial delivery".into());
        let full = encode_frame(&term);

        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = PortCodec.decode(&mut buf).expect("decode");
            if i + 1 < full.len() {
                assert!(result.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(result, Some(term.clone()));
            }
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let a = Term::atom("first");
        let b = Term::atom("second");
        let mut buf = encode_frame(&a);
        buf.extend_from_slice(&encode_frame(&b));

        assert_eq!(PortCodec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(PortCodec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(PortCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let mut buf = BytesMut::from(&[0u8, 3, 1, 2, 3][..]);
        assert!(PortCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let term = Term::Bin(vec![0u8; MAX_FRAME_SIZE + 1]);
        let mut buf = BytesMut::new();
        match PortCodec.encode(term, &mut buf) {
            Err(IpcError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
