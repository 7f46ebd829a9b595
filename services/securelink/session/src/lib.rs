//! Key exchange, secure frame codec, rekey state machine and link lifecycle.
//!
//! This crate protects the host interface between a host driver and a
//! device: an X25519 key exchange authenticated by a pre-shared key, an
//! AES-128-CCM frame codec with per-direction sequence counters, and a
//! worker that renews the session key before a counter can wrap.
//!
//! ## Features
//!
//! - **Authenticated Key Exchange**: HMAC-SHA512 tagged ephemeral X25519 keys
//! - **Secure Frame Codec**: AES-128-CCM, 16-byte tags, padded payloads
//! - **Command Policy**: per-message-type encryption bitmap
//! - **Transparent Rekey**: outbound traffic is held, never dropped, while
//!   a new key is negotiated
//! - **Link Modes**: disabled, optional (trusted) and mandatory (enforced)
//! - **Device Emulator**: software firmware stand-in for tests and self-test
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use securelink_session::{
//!     LinkConfig, LinkEvent, LinkMode, PreSharedKey, SecureLink, StreamTransport,
//! };
//! use securelink_wire::Message;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let config = LinkConfig {
//!     mode: LinkMode::MandatoryEnforced,
//!     psk: PreSharedKey::from_hex(&"aa".repeat(32))?,
//!     ..LinkConfig::default()
//! };
//!
//! let (link, mut events) = SecureLink::new(StreamTransport::new(stream), config)?;
//! link.bring_up().await?;
//!
//! link.send(Message::new(0x4A, Bytes::from_static(b"ping"))).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LinkEvent::Message(message) => {
//!             println!("Received message {:#04x}", message.id);
//!         }
//!         LinkEvent::Closed => break,
//!         other => println!("{:?}", other),
//!     }
//! }
//! link.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod crypto;
pub mod device;
pub mod handshake;
pub mod link;
pub mod rekey;
pub mod transport;

pub use codec::{build_nonce, DecodeError, Direction, EncodeError, Role, SecureSession};
pub use config::{ConfigError, LinkConfig, LinkMode};
pub use crypto::{CryptoError, EphemeralKeyPair, PreSharedKey, SessionKey};
pub use device::{DeviceBehavior, DeviceConfig, DeviceCounters, DeviceHandle, SimulatedDevice};
pub use handshake::{run_handshake, ExchangeSlot, Handshake, HandshakeError, ReplySlot};
pub use link::{LinkError, LinkEvent, LinkStats, PolicyViolation, SecureLink};
pub use rekey::{LinkState, RekeyReason, RetryPolicy, TxGate};
pub use transport::{connect_tcp, StreamTransport, Transport, TransportError};
