//! Secure frame structure and stream framing.
//!
//! ```text
//! +-----------+---------+--------+------------------------------+-----------+
//! | u16 len   | u8 flag | u8 seq | payload                      | tag (opt) |
//! | (LE)      |         |        | plain: len bytes             | 16 bytes  |
//! |           |         |        | encrypted: round_up(len, 16) |           |
//! +-----------+---------+--------+------------------------------+-----------+
//! ```

use crate::header::{FrameHeader, CCM_TAG_SIZE, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Largest frame the stream decoder accepts (header + padded payload + tag)
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_MESSAGE_SIZE + 1 + CCM_TAG_SIZE;

/// A single frame as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    /// Frame header
    pub header: FrameHeader,
    /// Plaintext, or padded ciphertext followed by the tag
    pub body: Bytes,
}

impl SecureFrame {
    /// Wrap a plaintext message in a plain (unencrypted) frame
    pub fn plain(message: Bytes) -> Result<Self, crate::WireError> {
        let len = u16::try_from(message.len()).map_err(|_| crate::WireError::Size(message.len()))?;
        Ok(Self {
            header: FrameHeader::plain(len),
            body: message,
        })
    }

    /// Assemble an encrypted frame from a sealed body (ciphertext || tag)
    pub fn encrypted(len: u16, seq: u8, sealed: Bytes) -> Result<Self, crate::WireError> {
        let header = FrameHeader::encrypted(len, seq);
        if sealed.len() != header.body_len() {
            return Err(crate::WireError::BodyLength {
                got: sealed.len(),
                expected: header.body_len(),
            });
        }
        Ok(Self {
            header,
            body: sealed,
        })
    }

    /// Whether the body is AEAD protected
    pub fn is_encrypted(&self) -> bool {
        self.header.is_encrypted()
    }

    /// Logical (unpadded) message length
    pub fn message_len(&self) -> usize {
        self.header.len as usize
    }

    /// Sequence byte carried by the frame
    pub fn seq(&self) -> u8 {
        self.header.seq
    }

    /// Split an encrypted body into (padded ciphertext, tag)
    pub fn sealed_parts(&self) -> Option<(&[u8], &[u8])> {
        if !self.is_encrypted() || self.body.len() < CCM_TAG_SIZE {
            return None;
        }
        Some(self.body.split_at(self.body.len() - CCM_TAG_SIZE))
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Parse exactly one frame from `bytes`
    pub fn parse(mut bytes: Bytes) -> Result<Self, crate::WireError> {
        let header = FrameHeader::decode(&mut bytes)?;
        if bytes.len() != header.body_len() {
            return Err(crate::WireError::BodyLength {
                got: bytes.len(),
                expected: header.body_len(),
            });
        }
        Ok(Self {
            header,
            body: bytes,
        })
    }
}

/// Frame decoder for splitting a byte stream into frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Split the raw bytes of one complete frame off the front of `buf`
    pub fn split_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, crate::WireError> {
        // Need the full header to know how much follows
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&mut &buf[..FRAME_HEADER_SIZE])?;
        let frame_len = FRAME_HEADER_SIZE + header.body_len();
        if frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }

        if buf.len() < frame_len {
            trace!(have = buf.len(), need = frame_len, "Partial frame buffered");
            return Ok(None);
        }

        Ok(Some(buf.split_to(frame_len).freeze()))
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<SecureFrame>, crate::WireError> {
        match self.split_frame(buf)? {
            Some(raw) => SecureFrame::parse(raw).map(Some),
            None => Ok(None),
        }
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
    use crate::WireError;

    #[test]
    fn test_plain_frame_encode() {
        let frame = SecureFrame::plain(Bytes::from_static(b"\x28abc")).unwrap();
        assert!(!frame.is_encrypted());
        assert_eq!(&frame.encode()[..], b"\x04\x00\x00\x00\x28abc");
    }

    #[test]
    fn test_encrypted_frame_requires_padded_body() {
        let ok = SecureFrame::encrypted(3, 9, Bytes::from(vec![0u8; 32])).unwrap();
        assert_eq!(ok.seq(), 9);
        assert_eq!(ok.message_len(), 3);
        let (cipher, tag) = ok.sealed_parts().unwrap();
        assert_eq!(cipher.len(), 16);
        assert_eq!(tag.len(), 16);

        let err = SecureFrame::encrypted(3, 9, Bytes::from(vec![0u8; 19])).unwrap_err();
        assert_eq!(err, WireError::BodyLength { got: 19, expected: 32 });
    }

    #[test]
    fn test_parse_rejects_truncated_body() {
        let raw = Bytes::from_static(b"\x05\x00\x01\x00short");
        assert!(matches!(
            SecureFrame::parse(raw),
            Err(WireError::BodyLength { got: 5, expected: 32 })
        ));
    }

    #[test]
    fn test_oversized_plain_message() {
        let big = Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert_eq!(
            SecureFrame::plain(big),
            Err(WireError::Size(MAX_MESSAGE_SIZE + 1))
        );
    }

    #[test]
    fn test_decoder_handles_partial_and_back_to_back_frames() {
        let first = SecureFrame::plain(Bytes::from_static(b"\xe0dump")).unwrap();
        let second = SecureFrame::encrypted(1, 4, Bytes::from(vec![0xAB; 32])).unwrap();

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first.encode());
        stream.extend_from_slice(&second.encode());

        let mut decoder = FrameDecoder::new();

        // Feed everything but the last byte
        let mut buf = stream.split_to(stream.len() - 1);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&stream);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }
}
