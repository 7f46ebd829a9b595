//! Key material and primitives used by the key exchange.
//!
//! The pre-shared key authenticates ephemeral X25519 public keys with
//! HMAC-SHA512. The agreed shared secret is hashed with SHA-256 and the
//! leading 16 bytes become the AES-128 session key.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use securelink_wire::{PUB_KEY_MAC_SIZE, PUB_KEY_SIZE};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

type HmacSha512 = Hmac<Sha512>;

/// Size of the pre-shared key
pub const PSK_SIZE: usize = 32;

/// Size of the AES-128 session key
pub const SESSION_KEY_SIZE: usize = 16;

/// Cryptographic failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Pre-shared key could not be parsed
    #[error("invalid pre-shared key: {0}")]
    InvalidPsk(String),

    /// MAC could not be keyed
    #[error("invalid mac key length")]
    InvalidKeyLength,

    /// Public key tag does not match
    #[error("public key authentication tag mismatch")]
    MacMismatch,

    /// Peer sent a low-order point, the shared secret is all zero
    #[error("key agreement produced a non-contributory shared secret")]
    LowOrderPoint,
}

/// 32-byte secret shared out of band between host and device
#[derive(Clone, Default)]
pub struct PreSharedKey(Zeroizing<[u8; PSK_SIZE]>);

impl PreSharedKey {
    /// Wrap raw key bytes
    pub fn new(bytes: [u8; PSK_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a 64 character hex string
    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let mut raw = Zeroizing::new([0u8; PSK_SIZE]);
        hex::decode_to_slice(value.trim(), raw.as_mut_slice())
            .map_err(|e| CryptoError::InvalidPsk(e.to_string()))?;
        Ok(Self(raw))
    }

    /// An all-zero key counts as not provisioned
    pub fn is_provisioned(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; PSK_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreSharedKey")
            .field("provisioned", &self.is_provisioned())
            .finish_non_exhaustive()
    }
}

/// AES-128 key protecting one session
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_SIZE]>);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// HMAC-SHA512 over a public key, keyed with the pre-shared key
pub fn pubkey_mac(
    psk: &PreSharedKey,
    public_key: &[u8; PUB_KEY_SIZE],
) -> Result<[u8; PUB_KEY_MAC_SIZE], CryptoError> {
    let mut mac =
        HmacSha512::new_from_slice(psk.as_bytes()).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(public_key);
    let mut tag = [0u8; PUB_KEY_MAC_SIZE];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Check a peer's public key tag in constant time
pub fn verify_pubkey_mac(
    psk: &PreSharedKey,
    public_key: &[u8; PUB_KEY_SIZE],
    tag: &[u8],
) -> Result<(), CryptoError> {
    let expected = pubkey_mac(psk, public_key)?;
    if bool::from(expected.as_slice().ct_eq(tag)) {
        Ok(())
    } else {
        Err(CryptoError::MacMismatch)
    }
}

/// SHA-256 of the shared secret, truncated to the AES-128 key size
pub fn derive_session_key(shared_secret: &[u8; 32]) -> SessionKey {
    let mut digest: [u8; 32] = Sha256::digest(shared_secret).into();
    let mut key = [0u8; SESSION_KEY_SIZE];
    key.copy_from_slice(&digest[..SESSION_KEY_SIZE]);
    digest.zeroize();
    let session_key = SessionKey::from_bytes(key);
    key.zeroize();
    session_key
}

/// Ephemeral X25519 key pair, consumed by a single key agreement
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Fresh key pair from the OS random source
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Key pair from fixed secret bytes, for known-answer testing
    #[doc(hidden)]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key in wire (RFC 7748 little-endian) order
    pub fn public_key(&self) -> [u8; PUB_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Agree with the peer and derive the session key, consuming the pair
    pub fn agree(self, peer_public: &[u8; PUB_KEY_SIZE]) -> Result<SessionKey, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(derive_session_key(shared.as_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod vectors {
    //! RFC 7748 section 6.1 key pairs and values derived from them.

    pub const ALICE_SECRET: &str =
        "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a";
    pub const ALICE_PUBLIC: &str =
        "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a";
    pub const BOB_SECRET: &str =
        "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb";
    pub const BOB_PUBLIC: &str =
        "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f";
    pub const SESSION_KEY: &str = "dead45a1d43d6902aa9240b43c0d75a0";
    pub const ALICE_MAC: &str = "a9b49857b6bc02061d2e97d566ed77a1e5d7ee6058b6014a6d464e51758e4ec00c8c5afc9c1f44762d4358ccc6f37b4946880684a09c81e083148933be4ea11e";
    pub const BOB_MAC: &str = "bd00f6ae7703d74b7c9d18924df1dbe2e81f9ec8c2451b26f9a7cca8c32c80455ef53c488a8bceb950fa595d1736a4b4791d33c2ad8af13e1420e8871f05fc6f";

    pub fn bytes32(value: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        hex::decode_to_slice(value, &mut out).unwrap();
        out
    }

    pub fn psk() -> super::PreSharedKey {
        super::PreSharedKey::new([0xAA; 32])
    }
}
