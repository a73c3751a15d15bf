//! Length-prefixed stream framing
//!
//! A record on a TCP stream is a 4-byte native-endian length followed by that
//! many payload bytes. The length excludes the header itself.

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};

use crate::ring_buffer::RingBuffer;

/// Size of the length prefix.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    pub len: u32,
}

impl FrameHeader {
    pub fn new(payload_len: usize) -> Self {
        Self { len: payload_len as u32 }
    }

    /// Reads a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn read(buf: &[u8]) -> Option<Self> {
        buf.get(..HEADER_LEN).map(bytemuck::pod_read_unaligned)
    }

    /// Reads the header at the front of `ring` without consuming it.
    pub fn peek(ring: &RingBuffer) -> Option<Self> {
        let mut raw = [0u8; HEADER_LEN];
        (ring.peek(&mut raw) == HEADER_LEN).then(|| bytemuck::pod_read_unaligned(&raw))
    }

    pub fn payload_len(self) -> usize {
        self.len as usize
    }
}

/// Builds one framed record around `payload`.
///
/// # Panics
///
/// Panics if `payload` is longer than `u32::MAX` bytes.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(&mut out, payload);
    out.freeze()
}

/// Appends one framed record around `payload` to `out`.
pub fn encode_into(out: &mut BytesMut, payload: &[u8]) {
    assert!(payload.len() <= u32::MAX as usize, "frame payload too large");
    out.reserve(HEADER_LEN + payload.len());
    out.put_slice(bytemuck::bytes_of(&FrameHeader::new(payload.len())));
    out.put_slice(payload);
}

/// Splits complete records off the front of `buf`, a whole-buffer view of a
/// stream. Returns the payloads and the number of bytes they used.
pub fn decode_all(buf: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut frames = Vec::new();
    let mut at = 0;
    while let Some(header) = FrameHeader::read(&buf[at..]) {
        let end = at + HEADER_LEN + header.payload_len();
        if end > buf.len() {
            break;
        }
        frames.push(&buf[at + HEADER_LEN..end]);
        at = end;
    }
    (frames, at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_LEN, 4);
        let framed = encode(b"ping");
        assert_eq!(&framed[..4], &4u32.to_ne_bytes());
        assert_eq!(&framed[4..], b"ping");
        assert_eq!(FrameHeader::read(&framed), Some(FrameHeader { len: 4 }));
    }

    #[test]
    fn test_empty_payload() {
        let framed = encode(b"");
        assert_eq!(framed.len(), HEADER_LEN);
        let (frames, used) = decode_all(&framed);
        assert_eq!(frames, vec![&b""[..]]);
        assert_eq!(used, HEADER_LEN);
    }

    #[test]
    fn test_decode_stops_at_partial_record() {
        let mut buf = BytesMut::new();
        encode_into(&mut buf, b"alpha");
        encode_into(&mut buf, b"beta");
        encode_into(&mut buf, b"gamma");
        let cut = buf.len() - 2;

        let (frames, used) = decode_all(&buf[..cut]);
        assert_eq!(frames, vec![&b"alpha"[..], &b"beta"[..]]);
        assert_eq!(used, 2 * HEADER_LEN + 9);
    }

    #[test]
    fn test_peek_from_ring() {
        let mut ring = RingBuffer::new(32);
        ring.write(&7u32.to_ne_bytes()[..3]);
        assert_eq!(FrameHeader::peek(&ring), None);
        ring.write(&7u32.to_ne_bytes()[3..]);
        assert_eq!(FrameHeader::peek(&ring).map(FrameHeader::payload_len), Some(7));
        assert_eq!(ring.readable_size(), 4);
    }
}
