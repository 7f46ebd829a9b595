//! Host interface messages carried inside frames.
//!
//! A message is a one-byte type identifier followed by its body. The secure
//! link owns a handful of message types (key provisioning, public key
//! exchange, bitmap configuration); everything else is opaque to it.

use crate::header::msg_id;
use crate::policy::POLICY_BITMAP_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of an X25519 public key on the wire
pub const PUB_KEY_SIZE: usize = 32;

/// Size of the HMAC-SHA512 tag authenticating a public key
pub const PUB_KEY_MAC_SIZE: usize = 64;

/// Size of the pre-shared MAC key
pub const MAC_KEY_SIZE: usize = 32;

/// Status the legacy firmware reports for a successful key exchange
pub const LEGACY_PUB_KEY_EXCHANGE_SUCCESS: u32 = 0x0000_002F;

/// A host interface message (type identifier + body)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: u8,
    /// Message body
    pub body: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(id: u8, body: Bytes) -> Self {
        Self { id, body }
    }

    /// Bytes taken by the encoded message (identifier + body)
    pub fn encoded_len(&self) -> usize {
        1 + self.body.len()
    }

    /// Serialize to the plaintext carried by a frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.id);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse the plaintext carried by a frame
    pub fn decode(mut plaintext: Bytes) -> Result<Self, crate::WireError> {
        if plaintext.is_empty() {
            return Err(crate::WireError::EmptyMessage);
        }
        let id = plaintext.get_u8();
        Ok(Self {
            id,
            body: plaintext,
        })
    }
}

fn expect_size(id: u8, body: &[u8], expected: usize) -> Result<(), crate::WireError> {
    if body.len() != expected {
        return Err(crate::WireError::MessageSize {
            id,
            got: body.len(),
            expected,
        });
    }
    Ok(())
}

/// Host public key and its authentication tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKeyExchangeReq {
    /// Host ephemeral public key, device byte order
    pub public_key: [u8; PUB_KEY_SIZE],
    /// HMAC-SHA512 over `public_key` keyed with the pre-shared key
    pub mac: [u8; PUB_KEY_MAC_SIZE],
}

impl PubKeyExchangeReq {
    /// Body size on the wire
    pub const SIZE: usize = PUB_KEY_SIZE + PUB_KEY_MAC_SIZE;

    /// Build the request message
    pub fn to_message(&self) -> Message {
        let mut body = BytesMut::with_capacity(Self::SIZE);
        body.put_slice(&self.public_key);
        body.put_slice(&self.mac);
        Message::new(msg_id::SL_EXCHANGE_PUB_KEYS_REQ, body.freeze())
    }

    /// Parse the request body
    pub fn parse(mut body: &[u8]) -> Result<Self, crate::WireError> {
        expect_size(msg_id::SL_EXCHANGE_PUB_KEYS_REQ, body, Self::SIZE)?;
        let mut public_key = [0u8; PUB_KEY_SIZE];
        let mut mac = [0u8; PUB_KEY_MAC_SIZE];
        body.copy_to_slice(&mut public_key);
        body.copy_to_slice(&mut mac);
        Ok(Self { public_key, mac })
    }
}

/// Device public key, its authentication tag, and the negotiation status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKeyExchangeInd {
    /// Raw status as reported by the firmware
    pub status: u32,
    /// Device ephemeral public key, device byte order
    pub public_key: [u8; PUB_KEY_SIZE],
    /// HMAC-SHA512 over `public_key` keyed with the pre-shared key
    pub mac: [u8; PUB_KEY_MAC_SIZE],
}

impl PubKeyExchangeInd {
    /// Body size on the wire
    pub const SIZE: usize = 4 + PUB_KEY_SIZE + PUB_KEY_MAC_SIZE;

    /// Status with the legacy success code folded into 0
    pub fn normalized_status(&self) -> u32 {
        if self.status == LEGACY_PUB_KEY_EXCHANGE_SUCCESS {
            0
        } else {
            self.status
        }
    }

    /// Build the indication message
    pub fn to_message(&self) -> Message {
        let mut body = BytesMut::with_capacity(Self::SIZE);
        body.put_u32_le(self.status);
        body.put_slice(&self.public_key);
        body.put_slice(&self.mac);
        Message::new(msg_id::SL_EXCHANGE_PUB_KEYS_IND, body.freeze())
    }

    /// Parse the indication body
    pub fn parse(mut body: &[u8]) -> Result<Self, crate::WireError> {
        expect_size(msg_id::SL_EXCHANGE_PUB_KEYS_IND, body, Self::SIZE)?;
        let status = body.get_u32_le();
        let mut public_key = [0u8; PUB_KEY_SIZE];
        let mut mac = [0u8; PUB_KEY_MAC_SIZE];
        body.copy_to_slice(&mut public_key);
        body.copy_to_slice(&mut mac);
        Ok(Self {
            status,
            public_key,
            mac,
        })
    }
}

/// Where the device stores a pushed MAC key
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacKeyDestination {
    /// One-time programmable memory (permanent)
    Otp = 0,
    /// Volatile memory, lost on reset
    Ram = 1,
}

impl TryFrom<u8> for MacKeyDestination {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MacKeyDestination::Otp),
            1 => Ok(MacKeyDestination::Ram),
            _ => Err(crate::WireError::Destination(value)),
        }
    }
}

/// Pre-shared key provisioning request
#[derive(Clone, PartialEq, Eq)]
pub struct SetMacKeyReq {
    /// Target key store
    pub destination: MacKeyDestination,
    /// Key material
    pub key: [u8; MAC_KEY_SIZE],
}

impl fmt::Debug for SetMacKeyReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetMacKeyReq")
            .field("destination", &self.destination)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SetMacKeyReq {
    /// Body size on the wire
    pub const SIZE: usize = 2 + MAC_KEY_SIZE;

    /// Build the request message
    pub fn to_message(&self) -> Message {
        let mut body = BytesMut::with_capacity(Self::SIZE);
        body.put_u8(self.destination as u8);
        body.put_u8(0);
        body.put_slice(&self.key);
        Message::new(msg_id::SET_SL_MAC_KEY_REQ, body.freeze())
    }

    /// Parse the request body
    pub fn parse(mut body: &[u8]) -> Result<Self, crate::WireError> {
        expect_size(msg_id::SET_SL_MAC_KEY_REQ, body, Self::SIZE)?;
        let destination = MacKeyDestination::try_from(body.get_u8())?;
        body.advance(1);
        let mut key = [0u8; MAC_KEY_SIZE];
        body.copy_to_slice(&mut key);
        Ok(Self { destination, key })
    }
}

/// Encryption bitmap synchronization request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlConfigureReq {
    /// Bit `n` set means message `n` must be encrypted
    pub encr_bitmap: [u8; POLICY_BITMAP_SIZE],
}

impl SlConfigureReq {
    /// Build the request message
    pub fn to_message(&self) -> Message {
        Message::new(
            msg_id::SL_CONFIGURE_REQ,
            Bytes::copy_from_slice(&self.encr_bitmap),
        )
    }

    /// Parse the request body
    pub fn parse(body: &[u8]) -> Result<Self, crate::WireError> {
        expect_size(msg_id::SL_CONFIGURE_REQ, body, POLICY_BITMAP_SIZE)?;
        let mut encr_bitmap = [0u8; POLICY_BITMAP_SIZE];
        encr_bitmap.copy_from_slice(body);
        Ok(Self { encr_bitmap })
    }
}

/// Generic confirmation: the request id, a leading status word, then data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirm {
    /// Identifier of the confirmed request
    pub id: u8,
    /// Status (0 = success)
    pub status: u32,
    /// Remaining confirmation data
    pub data: Bytes,
}

impl Confirm {
    /// Create a confirmation
    pub fn new(id: u8, status: u32, data: Bytes) -> Self {
        Self { id, status, data }
    }

    /// Build the confirmation message
    pub fn to_message(&self) -> Message {
        let mut body = BytesMut::with_capacity(4 + self.data.len());
        body.put_u32_le(self.status);
        body.put_slice(&self.data);
        Message::new(self.id, body.freeze())
    }

    /// Interpret a message as a confirmation
    pub fn from_message(message: &Message) -> Result<Self, crate::WireError> {
        if message.body.len() < 4 {
            return Err(crate::WireError::MessageSize {
                id: message.id,
                got: message.body.len(),
                expected: 4,
            });
        }
        let mut body = message.body.clone();
        let status = body.get_u32_le();
        Ok(Self {
            id: message.id,
            status,
            data: body,
        })
    }
}

/// Kind of an asynchronous device error indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Firmware rollback protection tripped
    FirmwareRollback,
    /// Firmware debug features are enabled
    FirmwareDebugEnabled,
    /// Device received traffic under a session key it already replaced
    OutdatedSessionKey,
    /// Device has no usable session key
    InvalidSessionKey,
    /// Supply voltage out of range
    OutOfRangeVoltage,
    /// Wrong platform data payload or version
    PdsVersion,
    /// Type not known to this crate
    Unknown(u32),
}

impl DeviceErrorKind {
    /// Map the type word of an error indication
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => DeviceErrorKind::FirmwareRollback,
            1 => DeviceErrorKind::FirmwareDebugEnabled,
            2 => DeviceErrorKind::OutdatedSessionKey,
            3 => DeviceErrorKind::InvalidSessionKey,
            4 => DeviceErrorKind::OutOfRangeVoltage,
            5 => DeviceErrorKind::PdsVersion,
            other => DeviceErrorKind::Unknown(other),
        }
    }

    /// Type word as carried on the wire
    pub fn code(&self) -> u32 {
        match self {
            DeviceErrorKind::FirmwareRollback => 0,
            DeviceErrorKind::FirmwareDebugEnabled => 1,
            DeviceErrorKind::OutdatedSessionKey => 2,
            DeviceErrorKind::InvalidSessionKey => 3,
            DeviceErrorKind::OutOfRangeVoltage => 4,
            DeviceErrorKind::PdsVersion => 5,
            DeviceErrorKind::Unknown(code) => *code,
        }
    }

    /// Whether the device is complaining about the secure link session
    pub fn is_session_key_error(&self) -> bool {
        matches!(
            self,
            DeviceErrorKind::OutdatedSessionKey | DeviceErrorKind::InvalidSessionKey
        )
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::FirmwareRollback => f.write_str("firmware rollback error"),
            DeviceErrorKind::FirmwareDebugEnabled => f.write_str("firmware debug feature enabled"),
            DeviceErrorKind::OutdatedSessionKey => f.write_str("outdated secure link session key"),
            DeviceErrorKind::InvalidSessionKey => f.write_str("invalid secure link session key"),
            DeviceErrorKind::OutOfRangeVoltage => f.write_str("out-of-range voltage"),
            DeviceErrorKind::PdsVersion => f.write_str("wrong PDS payload or version"),
            DeviceErrorKind::Unknown(code) => write!(f, "unknown error type {}", code),
        }
    }
}

/// Error indication (0xE4): a type word followed by type-specific data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInd {
    /// What went wrong
    pub kind: DeviceErrorKind,
    /// Type-specific data
    pub data: Bytes,
}

impl ErrorInd {
    /// Build the indication message
    pub fn to_message(&self) -> Message {
        let mut body = BytesMut::with_capacity(4 + self.data.len());
        body.put_u32_le(self.kind.code());
        body.put_slice(&self.data);
        Message::new(msg_id::ERROR_IND, body.freeze())
    }

    /// Parse an error indication body
    pub fn parse(body: &Bytes) -> Result<Self, crate::WireError> {
        if body.len() < 4 {
            return Err(crate::WireError::MessageSize {
                id: msg_id::ERROR_IND,
                got: body.len(),
                expected: 4,
            });
        }
        let mut body = body.clone();
        let kind = DeviceErrorKind::from_code(body.get_u32_le());
        Ok(Self { kind, data: body })
    }

    /// Leading status word of the data, when the device sent one
    pub fn status(&self) -> Option<u32> {
        let mut data = self.data.clone();
        (data.len() >= 4).then(|| data.get_u32_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    #[test]
    fn test_message_layout() {
        let message = Message::new(0x4A, Bytes::from_static(b"abc"));
        assert_eq!(message.encoded_len(), 4);
        assert_eq!(&message.encode()[..], b"\x4aabc");
        assert_eq!(Message::new(0x4A, Bytes::new()).encoded_len(), 1);
        assert_eq!(Message::decode(message.encode()).unwrap(), message);
        assert_eq!(Message::decode(Bytes::new()), Err(WireError::EmptyMessage));
    }

    #[test]
    fn test_pub_key_indication_layout() {
        let ind = PubKeyExchangeInd {
            status: LEGACY_PUB_KEY_EXCHANGE_SUCCESS,
            public_key: [0x11; PUB_KEY_SIZE],
            mac: [0x22; PUB_KEY_MAC_SIZE],
        };
        let message = ind.to_message();
        assert_eq!(message.id, msg_id::SL_EXCHANGE_PUB_KEYS_IND);
        assert_eq!(message.body.len(), 100);
        assert_eq!(&message.body[..4], &[0x2F, 0, 0, 0]);

        let parsed = PubKeyExchangeInd::parse(&message.body).unwrap();
        assert_eq!(parsed, ind);
        assert_eq!(parsed.normalized_status(), 0);
    }

    #[test]
    fn test_pub_key_indication_size_mismatch() {
        let err = PubKeyExchangeInd::parse(&[0u8; 68]).unwrap_err();
        assert_eq!(
            err,
            WireError::MessageSize {
                id: msg_id::SL_EXCHANGE_PUB_KEYS_IND,
                got: 68,
                expected: 100
            }
        );
    }

    #[test]
    fn test_non_legacy_status_is_kept() {
        let ind = PubKeyExchangeInd {
            status: 7,
            public_key: [0; PUB_KEY_SIZE],
            mac: [0; PUB_KEY_MAC_SIZE],
        };
        assert_eq!(ind.normalized_status(), 7);
    }

    #[test]
    fn test_set_mac_key_layout_and_redaction() {
        let req = SetMacKeyReq {
            destination: MacKeyDestination::Ram,
            key: [0xAA; MAC_KEY_SIZE],
        };
        let message = req.to_message();
        assert_eq!(message.id, msg_id::SET_SL_MAC_KEY_REQ);
        assert_eq!(&message.body[..2], &[1, 0]);
        assert_eq!(SetMacKeyReq::parse(&message.body).unwrap(), req);
        assert!(!format!("{:?}", req).contains("170"));
    }

    #[test]
    fn test_confirm_roundtrip() {
        let confirm = Confirm::new(0x29, 0, Bytes::from_static(b"ok"));
        let message = confirm.to_message();
        assert_eq!(&message.body[..], b"\x00\x00\x00\x00ok");
        assert_eq!(Confirm::from_message(&message).unwrap(), confirm);

        let short = Message::new(0x29, Bytes::from_static(b"\x00"));
        assert!(Confirm::from_message(&short).is_err());
    }

    #[test]
    fn test_error_indication_layout() {
        let body = Bytes::from_static(&[2, 0, 0, 0, 0x07, 0, 0, 0]);
        let ind = ErrorInd::parse(&body).unwrap();
        assert_eq!(ind.kind, DeviceErrorKind::OutdatedSessionKey);
        assert!(ind.kind.is_session_key_error());
        assert_eq!(ind.status(), Some(7));
        assert_eq!(ind.to_message(), Message::new(msg_id::ERROR_IND, body));

        let invalid = ErrorInd::parse(&Bytes::from_static(&[3, 0, 0, 0])).unwrap();
        assert_eq!(invalid.kind, DeviceErrorKind::InvalidSessionKey);
        assert_eq!(invalid.status(), None);
        assert_eq!(invalid.kind.to_string(), "invalid secure link session key");

        let other = ErrorInd::parse(&Bytes::from_static(&[0x20, 0, 0, 0])).unwrap();
        assert_eq!(other.kind, DeviceErrorKind::Unknown(0x20));
        assert!(!other.kind.is_session_key_error());
        assert_eq!(other.kind.code(), 0x20);
    }

    #[test]
    fn test_short_error_indication() {
        assert_eq!(
            ErrorInd::parse(&Bytes::from_static(&[2, 0])),
            Err(WireError::MessageSize {
                id: msg_id::ERROR_IND,
                got: 2,
                expected: 4
            })
        );
    }
}
