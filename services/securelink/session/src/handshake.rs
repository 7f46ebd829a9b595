//! Authenticated key exchange with the device.
//!
//! The host sends a fresh X25519 public key tagged with HMAC-SHA512 under the
//! pre-shared key, then waits for the device to confirm that request and to
//! send its own public key indication. Both replies reach the exchange
//! through an [`ExchangeSlot`] armed before the request goes out; an
//! indication is only accepted once the confirmation of the current request
//! has been seen, so a late answer to an abandoned attempt is discarded.
//! Only after the device's tag checks out is the shared secret computed and
//! the session key derived.

use bytes::Bytes;
use securelink_wire::{
    msg_id, Confirm, MacKeyDestination, Message, PubKeyExchangeInd, PubKeyExchangeReq,
    SecureFrame, SetMacKeyReq,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::crypto::{pubkey_mac, verify_pubkey_mac, EphemeralKeyPair, PreSharedKey, SessionKey};
use crate::transport::{Transport, TransportError};

/// Key exchange failures
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Device did not answer in time
    #[error("timed out after {0:?} waiting for the device")]
    Timeout(Duration),

    /// Device public key tag did not verify
    #[error("device public key failed authentication")]
    AuthenticationFailed,

    /// Key agreement or MAC computation failed
    #[error("crypto primitive failed: {0}")]
    CryptoPrimitiveFailed(String),

    /// Indication body has the wrong size
    #[error("key exchange indication is {got} bytes, expected {expected}")]
    KeySizeMismatch {
        /// Bytes received
        got: usize,
        /// Bytes required
        expected: usize,
    },

    /// Device confirmed a request with a failure status
    #[error("device rejected request {id:#04x} with status {status:#x}")]
    PeerRejected {
        /// Request identifier
        id: u8,
        /// Device status code
        status: u32,
    },

    /// Request could not be sent
    #[error("transport failure during handshake: {0}")]
    Transport(#[from] TransportError),

    /// Reply slot was dropped or re-armed before the device answered
    #[error("handshake aborted")]
    Aborted,
}

/// One-shot handoff of a device reply from the receive path to a waiter
#[derive(Debug, Default)]
pub struct ReplySlot {
    waiter: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl ReplySlot {
    /// Create an unarmed slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot and return the receiving end; a previous waiter is aborted
    pub fn arm(&self) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Drop any armed waiter
    pub fn disarm(&self) {
        self.waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether a waiter is armed
    pub fn is_armed(&self) -> bool {
        self.waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Hand `body` to the armed waiter; false when nobody was waiting
    pub fn complete(&self, body: Bytes) -> bool {
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match waiter {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

/// Waiters of one public key exchange
#[derive(Debug)]
struct PendingExchange {
    confirm: Option<oneshot::Sender<Bytes>>,
    indication: Option<oneshot::Sender<Bytes>>,
}

/// Handoff of the two replies to a public key request
///
/// The device answers a request with a confirmation and then an indication
/// carrying its key. The indication is only handed over after the
/// confirmation, so one left over from a timed-out attempt cannot be taken
/// for the answer to the current request.
#[derive(Debug, Default)]
pub struct ExchangeSlot {
    pending: Mutex<Option<PendingExchange>>,
}

impl ExchangeSlot {
    /// Create an unarmed slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for a new request; returns the confirmation and indication ends
    pub fn arm(&self) -> (oneshot::Receiver<Bytes>, oneshot::Receiver<Bytes>) {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (indication_tx, indication_rx) = oneshot::channel();
        *self.lock() = Some(PendingExchange {
            confirm: Some(confirm_tx),
            indication: Some(indication_tx),
        });
        (confirm_rx, indication_rx)
    }

    /// Drop the pending exchange
    pub fn disarm(&self) {
        self.lock().take();
    }

    /// Whether an exchange is pending
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Hand over the request confirmation; false when none was expected
    pub fn confirm(&self, body: Bytes) -> bool {
        let waiter = self
            .lock()
            .as_mut()
            .and_then(|pending| pending.confirm.take());
        match waiter {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    /// Hand over the device key indication; false when the current request
    /// is not confirmed yet or nothing is pending
    pub fn indicate(&self, body: Bytes) -> bool {
        let mut pending = self.lock();
        let confirmed = matches!(pending.as_ref(), Some(p) if p.confirm.is_none());
        if !confirmed {
            return false;
        }
        match pending.take().and_then(|p| p.indication) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingExchange>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn await_reply(
    slot: &ReplySlot,
    rx: oneshot::Receiver<Bytes>,
    timeout: Duration,
) -> Result<Bytes, HandshakeError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(_)) => Err(HandshakeError::Aborted),
        Err(_) => {
            slot.disarm();
            Err(HandshakeError::Timeout(timeout))
        }
    }
}

async fn send_plain<T: Transport + ?Sized>(
    transport: &T,
    message: &Message,
) -> Result<(), HandshakeError> {
    let frame = SecureFrame::plain(message.encode()).map_err(TransportError::from)?;
    transport.send(&frame).await?;
    Ok(())
}

/// A single key exchange attempt
pub struct Handshake<'a> {
    psk: &'a PreSharedKey,
    keypair: EphemeralKeyPair,
}

impl<'a> Handshake<'a> {
    /// Prepare an exchange with a fresh ephemeral key pair
    pub fn new(psk: &'a PreSharedKey) -> Self {
        Self::with_keypair(psk, EphemeralKeyPair::generate())
    }

    /// Prepare an exchange with a given key pair
    pub fn with_keypair(psk: &'a PreSharedKey, keypair: EphemeralKeyPair) -> Self {
        Self { psk, keypair }
    }

    /// Host public key sent in the request
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Run the exchange and derive the session key
    ///
    /// `timeout` bounds the whole attempt, from the request to the device
    /// key indication.
    pub async fn run<T: Transport + ?Sized>(
        self,
        transport: &T,
        slot: &ExchangeSlot,
        timeout: Duration,
    ) -> Result<SessionKey, HandshakeError> {
        let public_key = self.keypair.public_key();
        let mac = pubkey_mac(self.psk, &public_key)
            .map_err(|e| HandshakeError::CryptoPrimitiveFailed(e.to_string()))?;

        let (confirm_rx, indication_rx) = slot.arm();
        let request = PubKeyExchangeReq { public_key, mac }.to_message();
        if let Err(e) = send_plain(transport, &request).await {
            slot.disarm();
            return Err(e);
        }
        debug!("Sent host public key, waiting for device key");

        let replies = async {
            let confirm = confirm_rx.await.map_err(|_| HandshakeError::Aborted)?;
            check_confirm(msg_id::SL_EXCHANGE_PUB_KEYS_REQ, confirm)?;
            trace!("Public key request confirmed");
            indication_rx.await.map_err(|_| HandshakeError::Aborted)
        };
        let body = match tokio::time::timeout(timeout, replies).await {
            Ok(Ok(body)) => body,
            Ok(Err(HandshakeError::Aborted)) => return Err(HandshakeError::Aborted),
            Ok(Err(e)) => {
                slot.disarm();
                return Err(e);
            }
            Err(_) => {
                slot.disarm();
                return Err(HandshakeError::Timeout(timeout));
            }
        };
        let indication =
            PubKeyExchangeInd::parse(&body).map_err(|_| HandshakeError::KeySizeMismatch {
                got: body.len(),
                expected: PubKeyExchangeInd::SIZE,
            })?;

        let status = indication.normalized_status();
        if status != 0 {
            warn!(status, "Device reported a key negotiation error");
        }

        verify_pubkey_mac(self.psk, &indication.public_key, &indication.mac)
            .map_err(|_| HandshakeError::AuthenticationFailed)?;

        let key = self
            .keypair
            .agree(&indication.public_key)
            .map_err(|e| HandshakeError::CryptoPrimitiveFailed(e.to_string()))?;
        debug!("Key exchange complete");
        Ok(key)
    }
}

/// Run one key exchange with a fresh ephemeral key pair
pub async fn run_handshake<T: Transport + ?Sized>(
    psk: &PreSharedKey,
    transport: &T,
    slot: &ExchangeSlot,
    timeout: Duration,
) -> Result<SessionKey, HandshakeError> {
    Handshake::new(psk).run(transport, slot, timeout).await
}

/// Push the pre-shared key into the device's volatile key store
pub async fn push_mac_key<T: Transport + ?Sized>(
    psk: &PreSharedKey,
    transport: &T,
    confirm: &ReplySlot,
    timeout: Duration,
) -> Result<(), HandshakeError> {
    let rx = confirm.arm();
    let request = SetMacKeyReq {
        destination: MacKeyDestination::Ram,
        key: *psk.as_bytes(),
    }
    .to_message();
    if let Err(e) = send_plain(transport, &request).await {
        confirm.disarm();
        return Err(e);
    }

    let body = await_reply(confirm, rx, timeout).await?;
    check_confirm(msg_id::SET_SL_MAC_KEY_REQ, body)
}

/// Interpret a confirmation body, failing on a non-zero status
pub fn check_confirm(id: u8, body: Bytes) -> Result<(), HandshakeError> {
    let confirm = Confirm::from_message(&Message::new(id, body.clone())).map_err(|_| {
        HandshakeError::KeySizeMismatch {
            got: body.len(),
            expected: 4,
        }
    })?;
    if confirm.status != 0 {
        return Err(HandshakeError::PeerRejected {
            id,
            status: confirm.status,
        });
    }
    Ok(())
}
