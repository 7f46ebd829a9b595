//! Frame header processing for the wire protocol.
//!
//! Every frame exchanged with the device starts with the same 4-byte header:
//! the logical message length, a flag byte and the low byte of the sender's
//! sequence counter.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// AEAD block/alignment boundary for encrypted payloads
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Length of the authentication tag appended to encrypted payloads
pub const CCM_TAG_SIZE: usize = 16;

/// Largest logical message the 16-bit length field can describe
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Host interface message identifiers handled by the secure link itself.
///
/// Confirmations reuse the identifier of the request they answer.
pub mod msg_id {
    /// Push the pre-shared key into the device key store
    pub const SET_SL_MAC_KEY_REQ: u8 = 0x27;
    /// Host half of the public key exchange
    pub const SL_EXCHANGE_PUB_KEYS_REQ: u8 = 0x28;
    /// Synchronize the encryption bitmap with the device
    pub const SL_CONFIGURE_REQ: u8 = 0x29;
    /// Fatal firmware exception
    pub const EXCEPTION_IND: u8 = 0xE0;
    /// Asynchronous device error
    pub const ERROR_IND: u8 = 0xE4;
    /// Device half of the public key exchange
    pub const SL_EXCHANGE_PUB_KEYS_IND: u8 = 0xE5;
}

bitflags! {
    /// Frame flag byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FrameFlags: u8 {
        /// Payload is AEAD protected and followed by a tag
        const ENCRYPTED = 1 << 0;
    }
}

/// Round a logical length up to the cipher block boundary
pub fn padded_len(len: usize) -> usize {
    (len + CIPHER_BLOCK_SIZE - 1) / CIPHER_BLOCK_SIZE * CIPHER_BLOCK_SIZE
}

/// Frame header (4 bytes, little-endian length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Logical message length, the header excluded
    pub len: u16,
    /// Frame flags
    pub flags: FrameFlags,
    /// Low byte of the sender's sequence counter (0 for plain frames)
    pub seq: u8,
}

impl FrameHeader {
    /// Header for a plain (policy-exempt) frame
    pub fn plain(len: u16) -> Self {
        Self {
            len,
            flags: FrameFlags::empty(),
            seq: 0,
        }
    }

    /// Header for an AEAD-protected frame
    pub fn encrypted(len: u16, seq: u8) -> Self {
        Self {
            len,
            flags: FrameFlags::ENCRYPTED,
            seq,
        }
    }

    /// Whether the frame body is ciphertext plus tag
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(FrameFlags::ENCRYPTED)
    }

    /// Number of body bytes that follow this header on the wire
    pub fn body_len(&self) -> usize {
        if self.is_encrypted() {
            padded_len(self.len as usize) + CCM_TAG_SIZE
        } else {
            self.len as usize
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.len);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.seq);
    }

    /// Decode the header, advancing `buf` past it
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, crate::WireError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let len = buf.get_u16_le();
        let raw_flags = buf.get_u8();
        let flags = FrameFlags::from_bits(raw_flags).ok_or(crate::WireError::Reserved(raw_flags))?;
        let seq = buf.get_u8();

        Ok(Self { len, flags, seq })
    }
}
