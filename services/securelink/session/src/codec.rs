//! Secure frame codec.
//!
//! A [`SecureSession`] owns one AES-128-CCM session key together with the
//! transmit and receive sequence counters. Payloads are zero padded to the
//! 16-byte block boundary and sealed with a 16-byte tag and empty associated
//! data. The 12-byte nonce is all zero except for one little-endian word
//! carrying the sequence number; which word depends on the direction of
//! travel, so host and device sessions are built with opposite [`Role`]s.

use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use securelink_wire::{padded_len, SecureFrame, CCM_TAG_SIZE, MAX_MESSAGE_SIZE};
use thiserror::Error;
use tracing::{trace, warn};

use crate::crypto::SessionKey;

type Aes128Ccm = Ccm<Aes128, U16, U12>;

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Direction a frame travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    ToDevice,
    /// Device to host
    ToHost,
}

impl Direction {
    /// Index of the 32-bit nonce word carrying the sequence number
    pub fn nonce_word(&self) -> usize {
        match self {
            Direction::ToDevice => 2,
            Direction::ToHost => 1,
        }
    }
}

/// Which end of the link a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The host driver
    Host,
    /// The device firmware (or its emulator)
    Device,
}

impl Role {
    /// Direction of frames this side encodes
    pub fn outbound(&self) -> Direction {
        match self {
            Role::Host => Direction::ToDevice,
            Role::Device => Direction::ToHost,
        }
    }

    /// Direction of frames this side decodes
    pub fn inbound(&self) -> Direction {
        match self {
            Role::Host => Direction::ToHost,
            Role::Device => Direction::ToDevice,
        }
    }
}

/// Build the nonce for `seq` travelling in `direction`
pub fn build_nonce(seq: u32, direction: Direction) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    let offset = direction.nonce_word() * 4;
    nonce[offset..offset + 4].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Errors producing an encrypted frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Transmit counter reached the rekey threshold
    #[error("transmit sequence space exhausted at {0}")]
    NonceExhausted(u32),

    /// Message does not fit the 16-bit length field
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// No session key is installed
    #[error("no secure session established")]
    NoSession,
}

/// Errors opening an encrypted frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Tag verification failed
    #[error("frame authentication failed (seq {seq})")]
    AuthenticationFailed {
        /// Sequence byte the frame declared
        seq: u8,
    },

    /// Body does not match the declared length
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A plain frame was handed to the decoder
    #[error("frame is not encrypted")]
    NotEncrypted,

    /// No session key is installed
    #[error("no secure session established")]
    NoSession,
}

/// Session key and sequence counters for one direction pair
pub struct SecureSession {
    role: Role,
    cipher: Aes128Ccm,
    tx_seq: u32,
    rx_seq: u32,
    counter_max: u32,
}

impl SecureSession {
    /// Install a fresh session with both counters at zero
    pub fn new(key: &SessionKey, role: Role, counter_max: u32) -> Self {
        Self {
            role,
            cipher: Aes128Ccm::new(GenericArray::from_slice(key.as_bytes())),
            tx_seq: 0,
            rx_seq: 0,
            counter_max,
        }
    }

    /// Side of the link this session encodes for
    pub fn role(&self) -> Role {
        self.role
    }

    /// Next transmit sequence number
    pub fn tx_seq(&self) -> u32 {
        self.tx_seq
    }

    /// Next expected receive sequence number
    pub fn rx_seq(&self) -> u32 {
        self.rx_seq
    }

    /// Whether the transmit counter reached the threshold
    pub fn tx_exhausted(&self) -> bool {
        self.tx_seq >= self.counter_max
    }

    /// Whether the receive counter reached the threshold
    pub fn rx_exhausted(&self) -> bool {
        self.rx_seq >= self.counter_max
    }

    /// Seal `plaintext` into an encrypted frame and advance the tx counter
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<SecureFrame, EncodeError> {
        let len = plaintext.len();
        if len > MAX_MESSAGE_SIZE {
            return Err(EncodeError::MessageTooLarge(len));
        }
        if self.tx_exhausted() {
            return Err(EncodeError::NonceExhausted(self.tx_seq));
        }

        let seq = self.tx_seq;
        let padded = padded_len(len);
        let mut sealed = BytesMut::with_capacity(padded + CCM_TAG_SIZE);
        sealed.put_slice(plaintext);
        sealed.resize(padded, 0);

        let nonce = build_nonce(seq, self.role.outbound());
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], &mut sealed[..])
            .map_err(|_| EncodeError::MessageTooLarge(len))?;
        sealed.put_slice(&tag);

        let frame = SecureFrame::encrypted(len as u16, seq as u8, sealed.freeze())
            .map_err(|_| EncodeError::MessageTooLarge(len))?;
        self.tx_seq += 1;

        trace!(seq, len, "Encoded secure frame");
        Ok(frame)
    }

    /// Verify and open an encrypted frame
    ///
    /// The receive counter only moves when the tag verifies. A sequence
    /// number other than the expected one, or non-zero padding, is logged
    /// and otherwise accepted.
    pub fn decode(&mut self, frame: &SecureFrame) -> Result<Bytes, DecodeError> {
        if !frame.is_encrypted() {
            return Err(DecodeError::NotEncrypted);
        }
        let (ciphertext, tag) = frame
            .sealed_parts()
            .ok_or_else(|| DecodeError::MalformedFrame("missing tag".to_string()))?;
        let len = frame.message_len();
        if ciphertext.len() != padded_len(len) {
            return Err(DecodeError::MalformedFrame(format!(
                "declared length {} needs {} ciphertext bytes, got {}",
                len,
                padded_len(len),
                ciphertext.len()
            )));
        }

        let seq = frame.seq();
        let nonce = build_nonce(seq as u32, self.role.inbound());
        let mut buf = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                &[],
                &mut buf,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| DecodeError::AuthenticationFailed { seq })?;

        if seq as u32 != self.rx_seq {
            warn!(
                expected = self.rx_seq,
                got = seq,
                "Sequence gap on secure link, frames may have been lost"
            );
        }
        self.rx_seq = seq as u32 + 1;

        if buf[len..].iter().any(|b| *b != 0) {
            warn!(seq, len, "Non-zero padding in secure frame");
        }
        buf.truncate(len);

        trace!(seq, len, "Decoded secure frame");
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("tx_seq", &self.tx_seq)
            .field("rx_seq", &self.rx_seq)
            .field("counter_max", &self.counter_max)
            .finish_non_exhaustive()
    }
}
