//! The secure link: policy-driven encryption of host interface traffic.
//!
//! A [`SecureLink`] owns the transport, the current session and the link
//! state. Outbound messages go through [`SecureLink::send`], which encrypts
//! them when the link is secured and the command policy marks their type.
//! Inbound frames are pulled by a receive task that decrypts them, enforces
//! the policy, hands key exchange replies to the rekey worker and publishes
//! everything else as [`LinkEvent`]s.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::codec::{DecodeError, EncodeError, SecureSession};
use crate::config::{ConfigError, LinkConfig};
use crate::handshake::{ExchangeSlot, HandshakeError, ReplySlot};
use crate::rekey::{run_worker, LinkState, RekeyReason, TxGate, WorkerCommand};
use crate::transport::{Transport, TransportError};
use securelink_wire::{msg_id, CommandPolicy, ErrorInd, Message, SecureFrame, WireError};

/// A message arrived with the wrong protection for its type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyViolation {
    /// Message type identifier
    pub id: u8,
    /// Whether the offending frame was encrypted
    pub encrypted: bool,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protection = if self.encrypted {
            "encrypted"
        } else {
            "in the clear"
        };
        write!(
            f,
            "message {:#04x} received {} against the command policy",
            self.id, protection
        )
    }
}

impl std::error::Error for PolicyViolation {}

/// Secure link errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Key exchange failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Outbound encryption failed
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// Inbound decryption failed
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Inbound frame violated the command policy
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// Session renewal failed, encrypted messages can no longer be sent
    #[error("secure channel lost, cannot send message {id:#04x}")]
    SecureChannelLost {
        /// Message type identifier
        id: u8,
    },

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed frame or message
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Link was shut down
    #[error("secure link closed")]
    Closed,

    /// Pre-shared key is missing or all zero
    #[error("no pre-shared key provisioned")]
    MissingKey,

    /// Enforced bring-up failed; the link carries no traffic
    #[error("secure link negotiation failed")]
    Failed,

    /// Operation needs a settled link
    #[error("secure link is {0}")]
    NotReady(LinkState),
}

/// Events published by the receive task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Application message from the device
    Message(Message),
    /// Asynchronous error indication from the device
    DeviceError(ErrorInd),
    /// Firmware exception; the device stops answering until it is reset
    DeviceException {
        /// Exception dump
        dump: Bytes,
    },
    /// Inbound frame discarded
    FrameDropped {
        /// Why the frame was discarded
        reason: String,
    },
    /// Session key renewed
    Rekeyed,
    /// Session renewal failed
    Degraded {
        /// Failure description
        reason: String,
    },
    /// Transport closed
    Closed,
}

/// Link counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Frames written
    pub frames_sent: u64,
    /// Frames read
    pub frames_received: u64,
    /// Encrypted frames written
    pub encrypted_sent: u64,
    /// Encrypted frames successfully opened
    pub encrypted_received: u64,
    /// Inbound frames discarded
    pub frames_dropped: u64,
    /// Inbound frames whose tag did not verify
    pub auth_failures: u64,
    /// Inbound policy violations
    pub policy_violations: u64,
    /// Successful key exchanges
    pub handshakes: u64,
    /// Failed key exchange attempts
    pub handshake_failures: u64,
    /// Completed session renewals
    pub rekeys: u64,
}

/// Session, state and policy, always updated together
pub(crate) struct SharedState {
    pub(crate) session: Option<SecureSession>,
    pub(crate) state: LinkState,
    pub(crate) policy: CommandPolicy,
    pub(crate) stats: LinkStats,
    pub(crate) closed: bool,
}

pub(crate) struct LinkInner<T> {
    pub(crate) config: LinkConfig,
    pub(crate) transport: T,
    shared: Mutex<SharedState>,
    pub(crate) gate: TxGate,
    pub(crate) tx_lock: tokio::sync::Mutex<()>,
    pub(crate) key_exchange: ExchangeSlot,
    pub(crate) mac_key_confirm: ReplySlot,
    pub(crate) configure_confirm: ReplySlot,
    state_tx: watch::Sender<LinkState>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl<T: Transport> LinkInner<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, shared: &mut SharedState, state: LinkState) {
        if shared.state != state {
            debug!(from = %shared.state, to = %state, "Secure link state change");
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut LinkStats)) {
        f(&mut self.lock().stats);
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Close the gate and hand the exchange to the worker, once per cycle
    fn trigger_rekey(&self, shared: &mut SharedState, reason: RekeyReason) {
        if shared.state != LinkState::Established {
            return;
        }
        self.gate.close();
        self.set_state(shared, LinkState::Rekeying);
        if self.commands.send(WorkerCommand::Rekey(reason)).is_err() {
            warn!("Rekey worker gone, cannot renew session key");
        }
    }

    /// Frame `message` as the current state and policy require
    pub(crate) fn frame_outbound(
        &self,
        shared: &mut SharedState,
        message: &Message,
    ) -> Result<SecureFrame, LinkError> {
        if shared.closed {
            return Err(LinkError::Closed);
        }
        if shared.state == LinkState::Failed {
            return Err(LinkError::Failed);
        }

        let id = message.id;
        if !shared.state.is_secured() || !shared.policy.requires_encryption(id) {
            let frame = SecureFrame::plain(message.encode())?;
            shared.stats.frames_sent += 1;
            return Ok(frame);
        }
        if shared.state == LinkState::Degraded {
            return Err(LinkError::SecureChannelLost { id });
        }

        let session = shared.session.as_mut().ok_or(EncodeError::NoSession)?;
        let frame = session.encode(&message.encode())?;
        let exhausted = session.tx_exhausted();
        shared.stats.frames_sent += 1;
        shared.stats.encrypted_sent += 1;
        if exhausted {
            self.trigger_rekey(shared, RekeyReason::TxExhausted);
        }
        Ok(frame)
    }

    /// Open `frame` and check it against the policy
    fn frame_inbound(&self, frame: SecureFrame) -> Result<Message, LinkError> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        shared.stats.frames_received += 1;

        if frame.is_encrypted() {
            let session = shared.session.as_mut().ok_or(DecodeError::NoSession)?;
            let plaintext = match session.decode(&frame) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    if matches!(e, DecodeError::AuthenticationFailed { .. }) {
                        shared.stats.auth_failures += 1;
                    }
                    return Err(e.into());
                }
            };
            let exhausted = session.rx_exhausted();
            shared.stats.encrypted_received += 1;
            if exhausted {
                self.trigger_rekey(shared, RekeyReason::RxExhausted);
            }

            let message = Message::decode(plaintext)?;
            if !shared.policy.requires_encryption(message.id) {
                // Delivered anyway: the content authenticated fine
                shared.stats.policy_violations += 1;
                error!(
                    "{}",
                    PolicyViolation {
                        id: message.id,
                        encrypted: true
                    }
                );
            }
            Ok(message)
        } else {
            let message = Message::decode(frame.body)?;
            if shared.state.is_secured() && shared.policy.requires_encryption(message.id) {
                shared.stats.policy_violations += 1;
                let violation = PolicyViolation {
                    id: message.id,
                    encrypted: false,
                };
                error!("{}", violation);
                return Err(violation.into());
            }
            Ok(message)
        }
    }

    /// Route a decoded message; `None` when it was consumed internally
    fn dispatch(&self, message: Message) -> Option<LinkEvent> {
        match message.id {
            msg_id::SL_EXCHANGE_PUB_KEYS_IND => {
                if !self.key_exchange.indicate(message.body) {
                    warn!("Public key indication without a confirmed request ignored");
                }
                None
            }
            msg_id::SL_EXCHANGE_PUB_KEYS_REQ => {
                if !self.key_exchange.confirm(message.body) {
                    warn!("Unexpected public key confirmation ignored");
                }
                None
            }
            msg_id::SET_SL_MAC_KEY_REQ => {
                if !self.mac_key_confirm.complete(message.body) {
                    warn!("Unexpected mac key confirmation ignored");
                }
                None
            }
            msg_id::SL_CONFIGURE_REQ => {
                if !self.configure_confirm.complete(message.body) {
                    warn!("Unexpected configuration confirmation ignored");
                }
                None
            }
            msg_id::ERROR_IND => match ErrorInd::parse(&message.body) {
                Ok(indication) => {
                    match indication.status() {
                        Some(status) => error!(
                            session_key = indication.kind.is_session_key_error(),
                            "Device error: {} ({:#010x})",
                            indication.kind,
                            status
                        ),
                        None => error!(
                            session_key = indication.kind.is_session_key_error(),
                            "Device error: {}",
                            indication.kind
                        ),
                    }
                    Some(LinkEvent::DeviceError(indication))
                }
                Err(e) => {
                    warn!("Dropping malformed error indication: {}", e);
                    self.update_stats(|stats| stats.frames_dropped += 1);
                    Some(LinkEvent::FrameDropped {
                        reason: e.to_string(),
                    })
                }
            },
            msg_id::EXCEPTION_IND => {
                error!(len = message.body.len(), "Device firmware exception, device is frozen");
                Some(LinkEvent::DeviceException { dump: message.body })
            }
            _ => Some(LinkEvent::Message(message)),
        }
    }

    fn handle_frame(&self, frame: SecureFrame) -> Option<LinkEvent> {
        match self.frame_inbound(frame) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                self.update_stats(|stats| stats.frames_dropped += 1);
                Some(LinkEvent::FrameDropped {
                    reason: e.to_string(),
                })
            }
        }
    }
}

async fn run_receiver<T: Transport>(inner: Arc<LinkInner<T>>) {
    loop {
        match inner.transport.recv().await {
            Ok(Some(frame)) => {
                if let Some(event) = inner.handle_frame(frame) {
                    inner.emit(event);
                }
            }
            Ok(None) => {
                debug!("Device closed the link");
                break;
            }
            Err(e) => {
                error!("Secure link receive failed: {}", e);
                break;
            }
        }
    }
    inner.emit(LinkEvent::Closed);
}

/// Secure host/device link over a frame transport
pub struct SecureLink<T: Transport> {
    inner: Arc<LinkInner<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SecureLink<T> {
    /// Create the link and start its worker and receive tasks
    ///
    /// Must be called inside a tokio runtime. Returns the link and the
    /// stream of inbound events. Sends are held until [`bring_up`] settles
    /// the link.
    ///
    /// [`bring_up`]: SecureLink::bring_up
    pub fn new(
        transport: T,
        config: LinkConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LinkState::Uninitialized);

        let inner = Arc::new(LinkInner {
            config,
            transport,
            shared: Mutex::new(SharedState {
                session: None,
                state: LinkState::Uninitialized,
                policy: CommandPolicy::new(),
                stats: LinkStats::default(),
                closed: false,
            }),
            gate: TxGate::new(false),
            tx_lock: tokio::sync::Mutex::new(()),
            key_exchange: ExchangeSlot::new(),
            mac_key_confirm: ReplySlot::new(),
            configure_confirm: ReplySlot::new(),
            state_tx,
            commands: command_tx,
            events: event_tx,
        });

        let worker = tokio::spawn(run_worker(inner.clone(), command_rx));
        let receiver = tokio::spawn(run_receiver(inner.clone()));

        Ok((
            Self {
                inner,
                worker: Mutex::new(Some(worker)),
                receiver: Mutex::new(Some(receiver)),
            },
            event_rx,
        ))
    }

    /// Negotiate the link according to the configured mode
    ///
    /// Returns the settled state. Only enforced mode turns a failed
    /// negotiation into an error; the other modes fall back to plain traffic.
    /// A link is brought up once: any later call fails with
    /// [`LinkError::NotReady`] and leaves the link untouched.
    pub async fn bring_up(&self) -> Result<LinkState, LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .commands
            .send(WorkerCommand::Establish(done_tx))
            .map_err(|_| LinkError::Closed)?;
        done_rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Whether messages of type `id` are encrypted right now
    pub fn is_secure(&self, id: u8) -> bool {
        let shared = self.inner.lock();
        shared.state.is_secured() && shared.policy.requires_encryption(id)
    }

    /// Frame a message for the wire, encrypting it when required
    ///
    /// This bypasses send ordering; it refuses to run while a key exchange
    /// owns the link.
    pub fn encode_if_required(&self, message: &Message) -> Result<SecureFrame, LinkError> {
        let mut shared = self.inner.lock();
        match shared.state {
            LinkState::Uninitialized | LinkState::Handshaking | LinkState::Rekeying => {
                Err(LinkError::NotReady(shared.state))
            }
            _ => self.inner.frame_outbound(&mut shared, message),
        }
    }

    /// Open an inbound frame and check it against the command policy
    pub fn decode_if_required(&self, frame: SecureFrame) -> Result<Message, LinkError> {
        self.inner.frame_inbound(frame)
    }

    /// Send a message, waiting out any key renewal in progress
    pub async fn send(&self, message: Message) -> Result<(), LinkError> {
        loop {
            self.inner.gate.wait_open().await;
            let _tx = self.inner.tx_lock.lock().await;

            let frame = {
                let mut shared = self.inner.lock();
                if !self.inner.gate.is_open() && !shared.closed {
                    // A rekey started while we queued for the lock
                    continue;
                }
                self.inner.frame_outbound(&mut shared, &message)?
            };

            self.inner.transport.send(&frame).await?;
            trace!(id = message.id, encrypted = frame.is_encrypted(), "Sent message");
            return Ok(());
        }
    }

    /// Start a key renewal now
    pub fn request_rekey(&self) -> Result<(), LinkError> {
        let mut shared = self.inner.lock();
        if shared.state != LinkState::Established {
            return Err(LinkError::NotReady(shared.state));
        }
        self.inner.trigger_rekey(&mut shared, RekeyReason::Requested);
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> LinkStats {
        self.inner.lock().stats.clone()
    }

    /// Current command policy
    pub fn policy(&self) -> CommandPolicy {
        self.inner.lock().policy
    }

    /// Stop the worker and receive tasks and destroy the session key
    pub async fn shutdown(&self) {
        let _ = self.inner.commands.send(WorkerCommand::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Rekey worker ended abnormally: {}", e);
            }
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            receiver.abort();
            let _ = receiver.await;
        }

        {
            let mut shared = self.inner.lock();
            shared.closed = true;
            shared.session = None;
        }
        // Wake held senders so they observe the closed link
        self.inner.gate.open();
        debug!("Secure link shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PreSharedKey;
    use crate::transport::StreamTransport;
    use tokio::io::DuplexStream;

    fn link(config: LinkConfig) -> (SecureLink<StreamTransport<DuplexStream>>, DuplexStream) {
        let (host, device) = tokio::io::duplex(4096);
        let (link, _events) = SecureLink::new(StreamTransport::new(host), config).unwrap();
        (link, device)
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (host, _device) = tokio::io::duplex(64);
        let config = LinkConfig {
            nonce_counter_max: 300,
            ..LinkConfig::default()
        };
        assert!(matches!(
            SecureLink::new(StreamTransport::new(host), config),
            Err(LinkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_enforced_without_key_fails() {
        let (link, _device) = link(LinkConfig::default());
        assert!(matches!(link.bring_up().await, Err(LinkError::MissingKey)));
        assert_eq!(link.state(), LinkState::Failed);
        assert!(matches!(
            link.send(Message::new(0x4A, Bytes::new())).await,
            Err(LinkError::Failed)
        ));
    }

    #[tokio::test]
    async fn test_plain_frames_before_security() {
        let config = LinkConfig {
            mode: crate::config::LinkMode::OptionalTrusted,
            psk: PreSharedKey::default(),
            ..LinkConfig::default()
        };
        let (link, _device) = link(config);
        assert_eq!(link.bring_up().await.unwrap(), LinkState::Unsecured);

        assert!(!link.is_secure(0x4A));
        let frame = link
            .encode_if_required(&Message::new(0x4A, Bytes::from_static(b"x")))
            .unwrap();
        assert!(!frame.is_encrypted());

        let inbound = SecureFrame::plain(Bytes::from_static(b"\x4ay")).unwrap();
        let message = link.decode_if_required(inbound).unwrap();
        assert_eq!(message.id, 0x4A);
    }

    #[test]
    fn test_policy_violation_display() {
        let violation = PolicyViolation {
            id: 0x4A,
            encrypted: false,
        };
        assert_eq!(
            violation.to_string(),
            "message 0x4a received in the clear against the command policy"
        );
    }
}
