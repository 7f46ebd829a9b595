//! Link state machine and the rekey worker.
//!
//! Bring-up and every rekey run on one dedicated task fed by a command
//! channel, never on a caller's send or receive path. A rekey holds the
//! transmit lock for the whole handshake, so queued senders leave in order
//! once the new session is installed and the outbound gate reopens.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::codec::{Role, SecureSession};
use crate::config::{LinkConfig, LinkMode};
use crate::crypto::SessionKey;
use crate::handshake::{check_confirm, push_mac_key, run_handshake, HandshakeError};
use crate::link::{LinkError, LinkEvent, LinkInner};
use crate::transport::Transport;
use securelink_wire::{msg_id, CommandPolicy, SlConfigureReq};

/// Lifecycle of a secure link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Created, bring-up not requested yet
    Uninitialized,
    /// Link mode is disabled, all traffic is plain
    Disabled,
    /// Initial key exchange in progress
    Handshaking,
    /// Session key installed
    Established,
    /// Sequence space exhausted, new key exchange in progress
    Rekeying,
    /// Rekey failed; previous session kept for decoding only
    Degraded,
    /// Non-enforced bring-up failed, traffic runs in the clear
    Unsecured,
    /// Enforced bring-up failed
    Failed,
}

impl LinkState {
    /// Whether policy-marked messages are encrypted in this state
    pub fn is_secured(&self) -> bool {
        matches!(
            self,
            LinkState::Established | LinkState::Rekeying | LinkState::Degraded
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Uninitialized => "uninitialized",
            LinkState::Disabled => "disabled",
            LinkState::Handshaking => "handshaking",
            LinkState::Established => "established",
            LinkState::Rekeying => "rekeying",
            LinkState::Degraded => "degraded",
            LinkState::Unsecured => "unsecured",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What started a rekey
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyReason {
    /// Transmit counter reached the threshold
    TxExhausted,
    /// Receive counter reached the threshold
    RxExhausted,
    /// Requested through the API
    Requested,
}

/// Outbound gate: closed while a key exchange owns the link
#[derive(Debug)]
pub struct TxGate {
    tx: watch::Sender<bool>,
}

impl TxGate {
    /// Create a gate in the given position
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { tx }
    }

    /// Let senders through
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Hold senders
    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    /// Current position
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once open
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Retry schedule for failed key exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Full attempts, first one included
    pub attempts: u32,
    /// Delay before the first retry
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Schedule from link configuration
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            attempts: config.handshake_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// Requests handled by the rekey worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Initial bring-up, answered with the resulting state
    Establish(oneshot::Sender<Result<LinkState, LinkError>>),
    /// Replace the session key
    Rekey(RekeyReason),
    /// Stop the worker
    Shutdown,
}

/// Worker loop: one command at a time
pub(crate) async fn run_worker<T: Transport>(
    inner: Arc<LinkInner<T>>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    debug!("Rekey worker started");
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Establish(done) => {
                let result = inner.bring_up().await;
                let _ = done.send(result);
            }
            WorkerCommand::Rekey(reason) => inner.rekey(reason).await,
            WorkerCommand::Shutdown => break,
        }
    }
    debug!("Rekey worker stopped");
}

impl<T: Transport> LinkInner<T> {
    async fn handshake_with_retries(&self) -> Result<SessionKey, HandshakeError> {
        let retry = RetryPolicy::from_config(&self.config);
        let mut last_error = HandshakeError::Aborted;
        for attempt in 1..=retry.attempts {
            match run_handshake(
                &self.config.psk,
                &self.transport,
                &self.key_exchange,
                self.config.handshake_timeout,
            )
            .await
            {
                Ok(key) => {
                    self.update_stats(|stats| stats.handshakes += 1);
                    return Ok(key);
                }
                Err(e) => {
                    warn!(attempt, attempts = retry.attempts, error = %e, "Key exchange attempt failed");
                    self.update_stats(|stats| stats.handshake_failures += 1);
                    last_error = e;
                    if attempt < retry.attempts {
                        tokio::time::sleep(retry.delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    fn install(&self, key: &SessionKey) {
        let mut shared = self.lock();
        shared.session = Some(SecureSession::new(
            key,
            Role::Host,
            self.config.nonce_counter_max,
        ));
        self.set_state(&mut shared, LinkState::Established);
    }

    /// Non-enforced failure: carry on without encryption
    fn fall_back(&self, reason: &dyn fmt::Display) -> LinkState {
        warn!(mode = %self.config.mode, "Secure link unavailable, continuing unsecured: {}", reason);
        let mut shared = self.lock();
        shared.session = None;
        self.set_state(&mut shared, LinkState::Unsecured);
        self.gate.open();
        LinkState::Unsecured
    }

    fn fail(&self, error: LinkError) -> Result<LinkState, LinkError> {
        error!("Device requires a secure link but it could not be negotiated: {}", error);
        let mut shared = self.lock();
        shared.session = None;
        self.set_state(&mut shared, LinkState::Failed);
        self.gate.open();
        Err(error)
    }

    pub(crate) async fn bring_up(&self) -> Result<LinkState, LinkError> {
        {
            let shared = self.lock();
            if shared.state != LinkState::Uninitialized {
                warn!(state = %shared.state, "Secure link already brought up");
                return Err(LinkError::NotReady(shared.state));
            }
        }

        let mode = self.config.mode;
        if mode == LinkMode::Disabled {
            info!("Secure link disabled by configuration");
            let mut shared = self.lock();
            self.set_state(&mut shared, LinkState::Disabled);
            self.gate.open();
            return Ok(LinkState::Disabled);
        }

        if !self.config.psk.is_provisioned() {
            if mode.is_enforced() {
                return self.fail(LinkError::MissingKey);
            }
            return Ok(self.fall_back(&LinkError::MissingKey));
        }

        {
            let mut shared = self.lock();
            self.set_state(&mut shared, LinkState::Handshaking);
        }

        let _tx = self.tx_lock.lock().await;

        if mode == LinkMode::OptionalTrusted {
            if let Err(e) = push_mac_key(
                &self.config.psk,
                &self.transport,
                &self.mac_key_confirm,
                self.config.handshake_timeout,
            )
            .await
            {
                return Ok(self.fall_back(&e));
            }
            debug!("Pre-shared key pushed to device RAM");
        }

        let key = match self.handshake_with_retries().await {
            Ok(key) => key,
            Err(e) if mode.is_enforced() => return self.fail(LinkError::Handshake(e)),
            Err(e) => return Ok(self.fall_back(&e)),
        };

        if mode.is_enforced() {
            self.lock().policy.exempt(msg_id::SL_CONFIGURE_REQ);
        }
        self.install(&key);
        drop(key);

        if let Err(e) = self.configure().await {
            warn!("Secure link configuration not confirmed: {}", e);
        }

        self.gate.open();
        info!(mode = %mode, "Secure link established");
        Ok(LinkState::Established)
    }

    /// Push the encryption bitmap to the device; caller holds the tx lock
    ///
    /// The device always gets the default bitmap. A configuration carve-out
    /// only lets this request itself out, and is withdrawn as soon as the
    /// request is framed.
    async fn configure(&self) -> Result<(), LinkError> {
        let message = SlConfigureReq {
            encr_bitmap: CommandPolicy::new().bitmap(),
        }
        .to_message();

        let rx = self.configure_confirm.arm();
        let frame = {
            let mut shared = self.lock();
            let frame = self.frame_outbound(&mut shared, &message);
            shared.policy.require(msg_id::SL_CONFIGURE_REQ);
            frame
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.configure_confirm.disarm();
                return Err(e);
            }
        };
        if let Err(e) = self.transport.send(&frame).await {
            self.configure_confirm.disarm();
            return Err(e.into());
        }

        let body = match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => return Err(HandshakeError::Aborted.into()),
            Err(_) => {
                self.configure_confirm.disarm();
                return Err(HandshakeError::Timeout(self.config.handshake_timeout).into());
            }
        };
        check_confirm(msg_id::SL_CONFIGURE_REQ, body)?;
        debug!("Encryption bitmap synchronized with device");
        Ok(())
    }

    pub(crate) async fn rekey(&self, reason: RekeyReason) {
        let _tx = self.tx_lock.lock().await;
        info!(?reason, "Renewing secure link session key");

        match self.handshake_with_retries().await {
            Ok(key) => {
                {
                    let mut shared = self.lock();
                    shared.session = Some(SecureSession::new(
                        &key,
                        Role::Host,
                        self.config.nonce_counter_max,
                    ));
                    shared.stats.rekeys += 1;
                    self.set_state(&mut shared, LinkState::Established);
                    self.gate.open();
                }
                self.emit(LinkEvent::Rekeyed);
                debug!("Session key renewed");
            }
            Err(e) => {
                error!("Session key renewal failed, secure link degraded: {}", e);
                {
                    let mut shared = self.lock();
                    self.set_state(&mut shared, LinkState::Degraded);
                    self.gate.open();
                }
                self.emit(LinkEvent::Degraded {
                    reason: e.to_string(),
                });
            }
        }
    }
}
