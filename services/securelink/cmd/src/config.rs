//! Configuration handling for the securelink binary.
//!
//! Settings come from the `securelink:` section of a YAML file, then from
//! `SECURELINK_*` environment variables, then from command-line flags.

use anyhow::{Context, Result};
use securelink_session::{LinkConfig, LinkMode, PreSharedKey};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Binary configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Link settings handed to the library
    pub link: LinkConfig,
    /// TCP bridge to a bus daemon; self-test against the emulator when unset
    pub bridge: Option<SocketAddr>,
    /// Messages pushed through the link
    pub messages: u32,
    /// Body size of each message
    pub payload_size: usize,
    /// How long to wait for replies
    pub reply_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            bridge: None,
            messages: 16,
            payload_size: 32,
            reply_timeout: Duration::from_secs(2),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    securelink: Option<SectionConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct SectionConfig {
    mode: Option<String>,
    psk: Option<String>,
    handshake_timeout: Option<String>,
    nonce_counter_max: Option<u32>,
    handshake_attempts: Option<u32>,
    retry_backoff: Option<String>,
    bridge: Option<String>,
    messages: Option<u32>,
    payload_size: Option<usize>,
    reply_timeout: Option<String>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration for {}: {:?}", key, value))
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                if let Some(section) = root.securelink {
                    config.apply_section(section)?;
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_section(&mut self, section: SectionConfig) -> Result<()> {
        if let Some(mode) = section.mode {
            self.link.mode = mode.parse()?;
        }
        if let Some(psk) = section.psk {
            self.link.psk = PreSharedKey::from_hex(&psk).context("invalid securelink.psk")?;
        }
        if let Some(timeout) = section.handshake_timeout {
            self.link.handshake_timeout = parse_duration("handshake_timeout", &timeout)?;
        }
        if let Some(max) = section.nonce_counter_max {
            self.link.nonce_counter_max = max;
        }
        if let Some(attempts) = section.handshake_attempts {
            self.link.handshake_attempts = attempts;
        }
        if let Some(backoff) = section.retry_backoff {
            self.link.retry_backoff = parse_duration("retry_backoff", &backoff)?;
        }
        if let Some(bridge) = section.bridge {
            self.bridge = Some(bridge.parse().context("invalid securelink.bridge")?);
        }
        if let Some(messages) = section.messages {
            self.messages = messages;
        }
        if let Some(size) = section.payload_size {
            self.payload_size = size;
        }
        if let Some(timeout) = section.reply_timeout {
            self.reply_timeout = parse_duration("reply_timeout", &timeout)?;
        }
        Ok(())
    }

    /// Apply `SECURELINK_*` overrides found through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup("SECURELINK_MODE") {
            self.link.mode = mode.parse()?;
            info!("Link mode overridden by environment: {}", self.link.mode);
        }
        if let Some(psk) = lookup("SECURELINK_PSK") {
            self.link.psk = PreSharedKey::from_hex(&psk).context("invalid SECURELINK_PSK")?;
            info!("Pre-shared key overridden by environment");
        }
        if let Some(timeout) = lookup("SECURELINK_HANDSHAKE_TIMEOUT") {
            self.link.handshake_timeout =
                parse_duration("SECURELINK_HANDSHAKE_TIMEOUT", &timeout)?;
        }
        if let Some(max) = lookup("SECURELINK_NONCE_COUNTER_MAX") {
            self.link.nonce_counter_max = max
                .trim()
                .parse()
                .context("invalid SECURELINK_NONCE_COUNTER_MAX")?;
        }
        if let Some(bridge) = lookup("SECURELINK_BRIDGE") {
            self.bridge = Some(bridge.parse().context("invalid SECURELINK_BRIDGE")?);
            info!("Bridge address overridden by environment: {}", bridge);
        }
        Ok(())
    }

    /// Replace the link mode
    pub fn set_mode(&mut self, mode: LinkMode) {
        self.link.mode = mode;
    }
}
