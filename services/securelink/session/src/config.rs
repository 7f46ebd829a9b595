//! Secure link configuration.

use crate::crypto::PreSharedKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Bound on waiting for the device's public key indication
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Counter value at which a rekey starts
pub const DEFAULT_NONCE_COUNTER_MAX: u32 = 240;

/// Highest usable threshold; the wire carries a single sequence byte
pub const MAX_NONCE_COUNTER: u32 = 256;

/// Full handshakes attempted before giving up
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Delay before the first retry, doubled on each further retry
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// How the link treats encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    /// Never handshake, all traffic in the clear
    Disabled,
    /// Push the pre-shared key to volatile device storage, then handshake;
    /// fall back to clear traffic on failure
    OptionalTrusted,
    /// Handshake with the provisioned key; failure is fatal
    #[default]
    MandatoryEnforced,
}

impl LinkMode {
    /// Whether a handshake failure must abort bring-up
    pub fn is_enforced(&self) -> bool {
        matches!(self, LinkMode::MandatoryEnforced)
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkMode::Disabled => "disabled",
            LinkMode::OptionalTrusted => "optional-trusted",
            LinkMode::MandatoryEnforced => "mandatory-enforced",
        };
        f.write_str(name)
    }
}

impl FromStr for LinkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(LinkMode::Disabled),
            "optional-trusted" | "optional" | "trusted" => Ok(LinkMode::OptionalTrusted),
            "mandatory-enforced" | "enforced" | "mandatory" => Ok(LinkMode::MandatoryEnforced),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Invalid configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Unrecognized link mode name
    #[error("unknown link mode: {0}")]
    UnknownMode(String),

    /// Counter threshold outside 1..=256
    #[error("nonce_counter_max must be within 1..={max}, got {got}")]
    CounterMax {
        /// Configured value
        got: u32,
        /// Largest accepted value
        max: u32,
    },

    /// A zero timeout can never complete a handshake
    #[error("handshake_timeout must be non-zero")]
    ZeroTimeout,

    /// At least one handshake attempt is needed
    #[error("handshake_attempts must be at least 1")]
    ZeroAttempts,
}

/// Configuration for a secure link
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Link mode
    pub mode: LinkMode,
    /// Pre-shared key authenticating the key exchange
    pub psk: PreSharedKey,
    /// Bound on each wait for the device's public key
    pub handshake_timeout: Duration,
    /// Counter value that triggers a rekey
    pub nonce_counter_max: u32,
    /// Full handshakes per bring-up or rekey
    pub handshake_attempts: u32,
    /// Initial delay between handshake attempts
    pub retry_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::default(),
            psk: PreSharedKey::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            nonce_counter_max: DEFAULT_NONCE_COUNTER_MAX,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl LinkConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nonce_counter_max == 0 || self.nonce_counter_max > MAX_NONCE_COUNTER {
            return Err(ConfigError::CounterMax {
                got: self.nonce_counter_max,
                max: MAX_NONCE_COUNTER,
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.handshake_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}
