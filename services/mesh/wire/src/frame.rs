//! Message framing for the wire protocol.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 header_len       | CBOR header length         |
//! +----------------------+----------------------------+
//! | u32 payload_len      | payload length             |
//! +----------------------+----------------------------+
//! | u32 crc32            | over header and payload    |
//! +----------------------+----------------------------+
//! | header               | canonical CBOR             |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

use crate::envelope::{Envelope, Header};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum header size (64 KiB)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Length prefix and checksum
pub const FRAME_PREFIX_SIZE: usize = 12;

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode a header and payload into one contiguous frame
pub fn encode_frame(
    header: &Header,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<Bytes, WireError> {
    let mut header_raw = Vec::new();
    ciborium::into_writer(header, &mut header_raw)
        .map_err(|e| WireError::HeaderEncode(e.to_string()))?;

    if header_raw.len() > MAX_HEADER_SIZE {
        return Err(WireError::Size(header_raw.len()));
    }

    let total_size = FRAME_PREFIX_SIZE + header_raw.len() + payload.len();
    if total_size > max_frame_size {
        return Err(WireError::Size(total_size));
    }

    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_u32(header_raw.len() as u32);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(checksum(&header_raw, payload));
    buf.put_slice(&header_raw);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one envelope from a buffer, leaving partial frames in place
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let header_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let expected_crc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if header_len == 0 || header_len > MAX_HEADER_SIZE {
            return Err(WireError::Malformed);
        }

        let total_size = FRAME_PREFIX_SIZE + header_len + payload_len;
        if total_size > self.max_frame_size {
            return Err(WireError::Size(total_size));
        }

        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(FRAME_PREFIX_SIZE);
        let header_raw = buf.split_to(header_len).freeze();
        let payload = buf.split_to(payload_len).freeze();

        if checksum(&header_raw, &payload) != expected_crc {
            return Err(WireError::Checksum);
        }

        let header: Header = ciborium::from_reader(header_raw.as_ref())
            .map_err(|e| WireError::HeaderDecode(e.to_string()))?;

        Ok(Some(Envelope { header, payload }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    #[test]
    fn test_decode_split_across_reads() {
        let envelope = Envelope::new(
            Header::new("node-a", MessageKind::Data).with_recipient("node-b"),
            Bytes::from_static(b"payload"),
        );
        let encoded = envelope.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&encoded[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = Envelope::hi("node-a").encode().unwrap();
        let second = Envelope::hi("node-b").encode().unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().sender(), "node-a");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().sender(), "node-b");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch() {
        let encoded = Envelope::new(Header::new("node-a", MessageKind::Data), Bytes::from_static(b"abc"))
            .encode()
            .unwrap();
        let mut corrupted = BytesMut::from(&encoded[..]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.decode(&mut corrupted), Err(WireError::Checksum)));
    }

    #[test]
    fn test_size_limit() {
        let encoded = Envelope::new(Header::new("node-a", MessageKind::Data), vec![0u8; 1024])
            .encode()
            .unwrap();
        let mut buf = BytesMut::from(&encoded[..]);

        let mut decoder = FrameDecoder::with_max_frame_size(256);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }
}
