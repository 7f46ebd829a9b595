//! Wire format of the host/device secure link.
//!
//! This crate holds everything that is pure byte layout: the 4-byte frame
//! header, frame splitting for byte streams, the host interface messages the
//! secure link exchanges with the device, and the per-message encryption
//! policy bitmap. It does no cryptography.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------------+
//! | u16 len (LE)         | logical message length (id + body)     |
//! +----------------------+----------------------------------------+
//! | u8 flags             | bit0 = encrypted                       |
//! +----------------------+----------------------------------------+
//! | u8 seq               | low byte of the sender's counter       |
//! +----------------------+----------------------------------------+
//! | payload              | plain: len bytes                       |
//! |                      | encrypted: round_up(len, 16) bytes     |
//! +----------------------+----------------------------------------+
//! | tag (encrypted only) | 16-byte AES-CCM tag                    |
//! +----------------------+----------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod policy;

// Re-export main types
pub use error::WireError;
pub use frame::{FrameDecoder, SecureFrame, MAX_FRAME_SIZE};
pub use header::{
    msg_id, padded_len, FrameFlags, FrameHeader, CCM_TAG_SIZE, CIPHER_BLOCK_SIZE,
    FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE,
};
pub use message::{
    Confirm, DeviceErrorKind, ErrorInd, MacKeyDestination, Message, PubKeyExchangeInd, PubKeyExchangeReq, SetMacKeyReq,
    SlConfigureReq, LEGACY_PUB_KEY_EXCHANGE_SUCCESS, MAC_KEY_SIZE, PUB_KEY_MAC_SIZE,
    PUB_KEY_SIZE,
};
pub use policy::{CommandPolicy, DEFAULT_EXEMPT_IDS, POLICY_BITMAP_SIZE};
