//! Device side of the secure link, emulated in software.
//!
//! The emulator answers key provisioning, public key exchange and bitmap
//! configuration requests the way the firmware does, and echoes every other
//! message back, encrypted when its adopted policy says so. It drives the
//! integration tests and the binary's self-test.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Role, SecureSession};
use crate::config::MAX_NONCE_COUNTER;
use crate::crypto::{pubkey_mac, verify_pubkey_mac, EphemeralKeyPair, PreSharedKey};
use crate::transport::Transport;
use securelink_wire::{
    msg_id, CommandPolicy, Confirm, Message, PubKeyExchangeInd, PubKeyExchangeReq, SecureFrame,
    SetMacKeyReq, SlConfigureReq, LEGACY_PUB_KEY_EXCHANGE_SUCCESS,
};

/// How the emulated firmware answers key exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceBehavior {
    /// Well-behaved firmware
    #[default]
    Normal,
    /// Tags its public key with a corrupted MAC
    WrongMac,
    /// Never answers public key requests
    Silent,
    /// Reports success with the legacy status code
    LegacyStatus,
    /// Answers the first exchange only
    FailRekey,
    /// Confirms the first exchange at once but sends its key only after
    /// the given delay
    LateFirstReply(Duration),
}

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Key the device was provisioned with (all zero when blank)
    pub psk: PreSharedKey,
    /// Exchange behavior
    pub behavior: DeviceBehavior,
    /// Counter threshold of the device codec
    pub counter_max: u32,
    /// Fixed ephemeral secret, for reproducible exchanges
    pub secret: Option<[u8; 32]>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            psk: PreSharedKey::default(),
            behavior: DeviceBehavior::Normal,
            counter_max: MAX_NONCE_COUNTER,
            secret: None,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceStats {
    key_exchanges: AtomicU64,
    mac_key_pushes: AtomicU64,
    configures: AtomicU64,
    messages_echoed: AtomicU64,
    encrypted_received: AtomicU64,
    plain_received: AtomicU64,
    decode_failures: AtomicU64,
}

/// Snapshot of the emulator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounters {
    /// Completed key exchanges
    pub key_exchanges: u64,
    /// MAC keys pushed by the host
    pub mac_key_pushes: u64,
    /// Encryption bitmaps received
    pub configures: u64,
    /// Application messages echoed back
    pub messages_echoed: u64,
    /// Encrypted frames opened
    pub encrypted_received: u64,
    /// Plain frames received
    pub plain_received: u64,
    /// Frames that failed to decrypt
    pub decode_failures: u64,
}

enum DeviceCommand {
    SendIndication { message: Message, encrypted: bool },
    Shutdown,
}

/// Control handle of a running emulator
pub struct DeviceHandle {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    stats: Arc<DeviceStats>,
    policy: Arc<Mutex<CommandPolicy>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl DeviceHandle {
    /// Push an unsolicited indication to the host
    pub fn send_indication(&self, id: u8, body: Bytes, encrypted: bool) -> anyhow::Result<()> {
        self.commands
            .send(DeviceCommand::SendIndication {
                message: Message::new(id, body),
                encrypted,
            })
            .map_err(|_| anyhow::anyhow!("device emulator stopped"))
    }

    /// Current counters
    pub fn counters(&self) -> DeviceCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DeviceCounters {
            key_exchanges: load(&self.stats.key_exchanges),
            mac_key_pushes: load(&self.stats.mac_key_pushes),
            configures: load(&self.stats.configures),
            messages_echoed: load(&self.stats.messages_echoed),
            encrypted_received: load(&self.stats.encrypted_received),
            plain_received: load(&self.stats.plain_received),
            decode_failures: load(&self.stats.decode_failures),
        }
    }

    /// Encryption bitmap the device currently applies
    pub fn policy(&self) -> CommandPolicy {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the emulator and wait for it
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        self.task.await?
    }
}

/// Software stand-in for the device firmware
pub struct SimulatedDevice<T> {
    transport: T,
    config: DeviceConfig,
    psk: PreSharedKey,
    session: Option<SecureSession>,
    policy: Arc<Mutex<CommandPolicy>>,
    exchange_requests: u32,
    stats: Arc<DeviceStats>,
}

impl<T: Transport> SimulatedDevice<T> {
    /// Start the emulator on its own task
    pub fn spawn(transport: T, config: DeviceConfig) -> DeviceHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DeviceStats::default());
        let policy = Arc::new(Mutex::new(CommandPolicy::new()));
        let device = Self {
            transport,
            psk: config.psk.clone(),
            config,
            session: None,
            policy: policy.clone(),
            exchange_requests: 0,
            stats: stats.clone(),
        };
        let task = tokio::spawn(device.run(command_rx));
        DeviceHandle {
            commands: command_tx,
            stats,
            policy,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DeviceCommand>) -> anyhow::Result<()> {
        info!(behavior = ?self.config.behavior, "Device emulator started");
        loop {
            // Queued indications leave before the next host frame is read
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(DeviceCommand::SendIndication { message, encrypted }) => {
                        self.send_indication(message, encrypted).await?
                    }
                    Some(DeviceCommand::Shutdown) | None => break,
                },
                frame = self.transport.recv() => match frame? {
                    Some(frame) => self.handle_frame(frame).await?,
                    None => break,
                },
            }
        }
        debug!("Device emulator stopped");
        Ok(())
    }

    async fn handle_frame(&mut self, frame: SecureFrame) -> anyhow::Result<()> {
        let message = if frame.is_encrypted() {
            let Some(session) = self.session.as_mut() else {
                warn!("Device received an encrypted frame without a session");
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };
            match session.decode(&frame) {
                Ok(plaintext) => {
                    self.stats.encrypted_received.fetch_add(1, Ordering::Relaxed);
                    Message::decode(plaintext)?
                }
                Err(e) => {
                    warn!("Device dropped a frame: {}", e);
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        } else {
            self.stats.plain_received.fetch_add(1, Ordering::Relaxed);
            Message::decode(frame.body)?
        };

        match message.id {
            msg_id::SL_EXCHANGE_PUB_KEYS_REQ => self.exchange_keys(&message.body).await,
            msg_id::SET_SL_MAC_KEY_REQ => {
                let request = SetMacKeyReq::parse(&message.body)?;
                self.psk = PreSharedKey::new(request.key);
                self.stats.mac_key_pushes.fetch_add(1, Ordering::Relaxed);
                self.reply(Confirm::new(message.id, 0, Bytes::new()).to_message())
                    .await
            }
            msg_id::SL_CONFIGURE_REQ => {
                let request = SlConfigureReq::parse(&message.body)?;
                *self.policy.lock().unwrap_or_else(PoisonError::into_inner) =
                    CommandPolicy::from_bitmap(request.encr_bitmap);
                self.stats.configures.fetch_add(1, Ordering::Relaxed);
                self.reply(Confirm::new(message.id, 0, Bytes::new()).to_message())
                    .await
            }
            _ => {
                self.stats.messages_echoed.fetch_add(1, Ordering::Relaxed);
                self.reply(message).await
            }
        }
    }

    async fn exchange_keys(&mut self, body: &[u8]) -> anyhow::Result<()> {
        let request = PubKeyExchangeReq::parse(body)?;
        self.exchange_requests += 1;

        let behavior = self.config.behavior;
        if behavior == DeviceBehavior::Silent
            || (behavior == DeviceBehavior::FailRekey && self.exchange_requests > 1)
        {
            debug!("Device ignoring key exchange request");
            return Ok(());
        }

        if verify_pubkey_mac(&self.psk, &request.public_key, &request.mac).is_err() {
            warn!("Host public key failed authentication");
            let refusal = Confirm::new(msg_id::SL_EXCHANGE_PUB_KEYS_REQ, 1, Bytes::new());
            return self.send_plain(&refusal.to_message()).await;
        }
        let accepted = Confirm::new(msg_id::SL_EXCHANGE_PUB_KEYS_REQ, 0, Bytes::new());
        self.send_plain(&accepted.to_message()).await?;

        let keypair = match self.config.secret {
            Some(secret) => EphemeralKeyPair::from_secret_bytes(secret),
            None => EphemeralKeyPair::generate(),
        };
        let public_key = keypair.public_key();
        let mut mac = pubkey_mac(&self.psk, &public_key)?;
        if behavior == DeviceBehavior::WrongMac {
            mac[0] ^= 0xFF;
        }
        let status = if behavior == DeviceBehavior::LegacyStatus {
            LEGACY_PUB_KEY_EXCHANGE_SUCCESS
        } else {
            0
        };
        let key = keypair.agree(&request.public_key)?;

        self.session = Some(SecureSession::new(&key, Role::Device, self.config.counter_max));
        self.stats.key_exchanges.fetch_add(1, Ordering::Relaxed);
        debug!("Device installed a new session key");

        if let DeviceBehavior::LateFirstReply(delay) = behavior {
            if self.exchange_requests == 1 {
                debug!(?delay, "Device holding back its public key");
                tokio::time::sleep(delay).await;
            }
        }

        let indication = PubKeyExchangeInd {
            status,
            public_key,
            mac,
        };
        self.send_plain(&indication.to_message()).await
    }

    async fn send_plain(&self, message: &Message) -> anyhow::Result<()> {
        let frame = SecureFrame::plain(message.encode())?;
        self.transport.send(&frame).await?;
        Ok(())
    }

    async fn send_encrypted(&mut self, message: &Message) -> anyhow::Result<()> {
        let encoded = match self.session.as_mut() {
            Some(session) => session.encode(&message.encode()),
            None => return self.send_plain(message).await,
        };
        match encoded {
            Ok(frame) => {
                self.transport.send(&frame).await?;
                Ok(())
            }
            Err(e) => {
                warn!("Device could not encrypt message {:#04x}: {}", message.id, e);
                Ok(())
            }
        }
    }

    /// Answer with the protection the adopted policy asks for
    async fn reply(&mut self, message: Message) -> anyhow::Result<()> {
        let required = self
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requires_encryption(message.id);
        if self.session.is_some() && required {
            self.send_encrypted(&message).await
        } else {
            self.send_plain(&message).await
        }
    }

    async fn send_indication(&mut self, message: Message, encrypted: bool) -> anyhow::Result<()> {
        if encrypted {
            self.send_encrypted(&message).await
        } else {
            self.send_plain(&message).await
        }
    }
}
