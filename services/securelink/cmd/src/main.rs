//! Secure link driver binary.
//!
//! Brings a secure link up against a TCP bridge to a bus daemon, or against
//! the built-in device emulator when no bridge is given, pushes a burst of
//! messages through it and reports the link counters.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use securelink_session::{
    connect_tcp, DeviceBehavior, DeviceConfig, DeviceCounters, LinkEvent, LinkMode, LinkState,
    LinkStats, PreSharedKey, SecureLink, SimulatedDevice, StreamTransport, Transport,
};
use securelink_wire::Message;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::AppConfig;
use logging::SecureLinkLogFormatter;

/// Message type used for generated traffic
const TRAFFIC_MESSAGE_ID: u8 = 0x4A;

/// Host side of the secure link with a built-in device self-test
#[derive(Parser, Debug)]
#[command(name = "securelink", version, about = "Secure host/device link driver")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Link mode: disabled, optional-trusted, mandatory-enforced
    #[arg(long)]
    mode: Option<LinkMode>,

    /// Pre-shared key, 64 hex digits
    #[arg(long)]
    psk: Option<String>,

    /// Bus daemon bridge address, e.g. 127.0.0.1:7000
    #[arg(long)]
    bridge: Option<SocketAddr>,

    /// Number of messages to send
    #[arg(long)]
    messages: Option<u32>,

    /// Body size of each message in bytes
    #[arg(long)]
    payload_size: Option<usize>,

    /// Sequence threshold that triggers a rekey
    #[arg(long)]
    nonce_counter_max: Option<u32>,

    /// Key exchange reply timeout, e.g. 500ms
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// Emulated device behavior for self-test: normal, wrong-mac, silent,
    /// legacy-status, fail-rekey
    #[arg(long, default_value = "normal", value_parser = parse_behavior)]
    device_behavior: DeviceBehavior,

    /// Start the emulated device without a provisioned key
    #[arg(long)]
    device_blank_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn parse_behavior(value: &str) -> Result<DeviceBehavior, String> {
    match value {
        "normal" => Ok(DeviceBehavior::Normal),
        "wrong-mac" => Ok(DeviceBehavior::WrongMac),
        "silent" => Ok(DeviceBehavior::Silent),
        "legacy-status" => Ok(DeviceBehavior::LegacyStatus),
        "fail-rekey" => Ok(DeviceBehavior::FailRekey),
        other => Err(format!("unknown device behavior: {}", other)),
    }
}

/// Outcome of one run
#[derive(Debug, Serialize)]
struct Report {
    mode: String,
    state: LinkState,
    messages_sent: u32,
    replies: u32,
    device_errors: u32,
    frames_dropped: u32,
    elapsed_ms: u128,
    link: LinkStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<DeviceCounters>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("securelink={}", args.log_level).parse()?)
        .add_directive(format!("securelink_session={}", args.log_level).parse()?)
        .add_directive(format!("securelink_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(SecureLinkLogFormatter::new("securelink", true))
        .init();

    info!("Starting securelink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_from_file(&args.config)?;
    apply_args(&mut config, &args)?;
    config
        .link
        .validate()
        .context("invalid secure link configuration")?;

    let report = match config.bridge {
        Some(addr) => run_bridge(&config, addr).await?,
        None => run_self_test(&config, &args).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        component_info!(
            "report",
            "{} link {} after {} ms: {}/{} replies, {} rekeys, {} dropped frames",
            report.mode,
            report.state,
            report.elapsed_ms,
            report.replies,
            report.messages_sent,
            report.link.rekeys,
            report.link.frames_dropped
        );
    }
    Ok(())
}

fn apply_args(config: &mut AppConfig, args: &Args) -> Result<()> {
    if let Some(mode) = args.mode {
        config.set_mode(mode);
    }
    if let Some(psk) = &args.psk {
        config.link.psk = PreSharedKey::from_hex(psk).context("invalid --psk")?;
    }
    if let Some(bridge) = args.bridge {
        config.bridge = Some(bridge);
    }
    if let Some(messages) = args.messages {
        config.messages = messages;
    }
    if let Some(size) = args.payload_size {
        config.payload_size = size;
    }
    if let Some(max) = args.nonce_counter_max {
        config.link.nonce_counter_max = max;
    }
    if let Some(timeout) = args.handshake_timeout {
        config.link.handshake_timeout = timeout.into();
    }
    Ok(())
}

async fn run_bridge(config: &AppConfig, addr: SocketAddr) -> Result<Report> {
    component_info!("bridge", "Connecting to bus bridge at {}", addr);
    let transport = connect_tcp(addr)
        .await
        .with_context(|| format!("failed to connect to bridge {}", addr))?;
    let (link, events) = SecureLink::new(transport, config.link.clone())?;

    let result = exercise(&link, events, config).await;
    link.shutdown().await;
    result
}

async fn run_self_test(config: &AppConfig, args: &Args) -> Result<Report> {
    let device_config = DeviceConfig {
        psk: if args.device_blank_key {
            PreSharedKey::default()
        } else {
            config.link.psk.clone()
        },
        behavior: args.device_behavior,
        ..DeviceConfig::default()
    };
    component_info!(
        "selftest",
        "Running self-test against emulated device ({:?})",
        device_config.behavior
    );

    let (host_end, device_end) = tokio::io::duplex(64 * 1024);
    let device = SimulatedDevice::spawn(StreamTransport::new(device_end), device_config);
    let (link, events) = SecureLink::new(StreamTransport::new(host_end), config.link.clone())?;

    let result = exercise(&link, events, config).await;
    link.shutdown().await;

    let counters = device.counters();
    device.shutdown().await.context("device emulator failed")?;

    let mut report = result?;
    report.device = Some(counters);
    Ok(report)
}

/// Bring the link up, send the configured burst and collect replies
async fn exercise<T: Transport>(
    link: &SecureLink<T>,
    mut events: UnboundedReceiver<LinkEvent>,
    config: &AppConfig,
) -> Result<Report> {
    let started = Instant::now();
    let state = link
        .bring_up()
        .await
        .context("secure link bring-up failed")?;
    component_info!("link", "Secure link settled in state {}", state);

    let payload = Bytes::from(
        (0..config.payload_size)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>(),
    );
    let mut sent = 0;
    for _ in 0..config.messages {
        link.send(Message::new(TRAFFIC_MESSAGE_ID, payload.clone()))
            .await
            .with_context(|| format!("failed to send message {}", sent + 1))?;
        sent += 1;
    }
    debug!(sent, "Traffic burst sent");

    let mut report = Report {
        mode: config.link.mode.to_string(),
        state,
        messages_sent: sent,
        replies: 0,
        device_errors: 0,
        frames_dropped: 0,
        elapsed_ms: 0,
        link: LinkStats::default(),
        device: None,
    };
    collect_replies(&mut events, &mut report, config.reply_timeout).await;

    report.state = link.state();
    report.link = link.stats();
    report.elapsed_ms = started.elapsed().as_millis();
    Ok(report)
}

async fn collect_replies(
    events: &mut UnboundedReceiver<LinkEvent>,
    report: &mut Report,
    reply_timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + reply_timeout;
    while report.replies < report.messages_sent {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                component_warn!(
                    "link",
                    "Timed out with {} of {} replies",
                    report.replies,
                    report.messages_sent
                );
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        };

        match event {
            Some(LinkEvent::Message(message)) if message.id == TRAFFIC_MESSAGE_ID => {
                report.replies += 1
            }
            Some(LinkEvent::Message(message)) => {
                debug!(id = message.id, "Ignoring unrelated message")
            }
            Some(LinkEvent::DeviceError(indication)) => {
                component_error!("device", "Device error indication: {}", indication.kind);
                report.device_errors += 1;
            }
            Some(LinkEvent::DeviceException { dump }) => {
                component_error!("device", "Device firmware exception ({} bytes of dump)", dump.len());
                report.device_errors += 1;
                break;
            }
            Some(LinkEvent::FrameDropped { reason }) => {
                debug!("Frame dropped: {}", reason);
                report.frames_dropped += 1;
            }
            Some(LinkEvent::Rekeyed) => component_info!("link", "Session key renewed"),
            Some(LinkEvent::Degraded { reason }) => {
                component_warn!("link", "Secure link degraded: {}", reason)
            }
            Some(LinkEvent::Closed) | None => {
                component_warn!("link", "Link closed by peer");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "securelink",
            "--mode",
            "optional",
            "--psk",
            "bb".repeat(32).as_str(),
            "--messages",
            "4",
            "--nonce-counter-max",
            "16",
            "--handshake-timeout",
            "1s",
            "--device-behavior",
            "fail-rekey",
        ]);
        let mut config = AppConfig::default();
        apply_args(&mut config, &args).unwrap();

        assert_eq!(config.link.mode, LinkMode::OptionalTrusted);
        assert_eq!(config.link.psk.as_bytes(), &[0xBB; 32]);
        assert_eq!(config.messages, 4);
        assert_eq!(config.link.nonce_counter_max, 16);
        assert_eq!(config.link.handshake_timeout, Duration::from_secs(1));
        assert_eq!(args.device_behavior, DeviceBehavior::FailRekey);
    }

    #[test]
    fn test_unknown_behavior_rejected() {
        assert!(Args::try_parse_from(["securelink", "--device-behavior", "grumpy"]).is_err());
    }

    #[tokio::test]
    async fn test_self_test_round_trip() {
        let args = Args::parse_from(["securelink", "--psk", "aa".repeat(32).as_str()]);
        let mut config = AppConfig {
            messages: 20,
            ..AppConfig::default()
        };
        apply_args(&mut config, &args).unwrap();
        config.link.nonce_counter_max = 8;

        let report = run_self_test(&config, &args).await.unwrap();
        assert_eq!(report.state, LinkState::Established);
        assert_eq!(report.replies, 20);
        assert!(report.link.rekeys >= 1);
        assert_eq!(report.device.unwrap().messages_echoed, 20);
    }

    #[tokio::test]
    async fn test_self_test_fails_without_key() {
        let args = Args::parse_from(["securelink"]);
        let config = AppConfig::default();
        assert!(run_self_test(&config, &args).await.is_err());
    }
}
