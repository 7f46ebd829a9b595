//! End-to-end tests of the secure link against the device emulator.

use bytes::Bytes;
use securelink_session::{
    DecodeError, DeviceBehavior, DeviceConfig, DeviceHandle, HandshakeError, LinkConfig,
    LinkError, LinkEvent, LinkMode, LinkState, PreSharedKey, SecureLink, SimulatedDevice,
    StreamTransport,
};
use securelink_wire::{msg_id, CommandPolicy, DeviceErrorKind, ErrorInd, Message, SecureFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;

type HostLink = SecureLink<StreamTransport<DuplexStream>>;

const APP_ID: u8 = 0x4A;

fn psk() -> PreSharedKey {
    PreSharedKey::new([0xAA; 32])
}

fn link_config(mode: LinkMode) -> LinkConfig {
    LinkConfig {
        mode,
        psk: psk(),
        handshake_timeout: Duration::from_millis(200),
        handshake_attempts: 1,
        retry_backoff: Duration::from_millis(10),
        ..LinkConfig::default()
    }
}

fn device_config(behavior: DeviceBehavior) -> DeviceConfig {
    DeviceConfig {
        psk: psk(),
        behavior,
        ..DeviceConfig::default()
    }
}

fn setup(
    config: LinkConfig,
    device: DeviceConfig,
) -> (HostLink, UnboundedReceiver<LinkEvent>, DeviceHandle) {
    let (host_end, device_end) = tokio::io::duplex(64 * 1024);
    let device = SimulatedDevice::spawn(StreamTransport::new(device_end), device);
    let (link, events) = SecureLink::new(StreamTransport::new(host_end), config).unwrap();
    (link, events, device)
}

async fn next_event(
    events: &mut UnboundedReceiver<LinkEvent>,
    wanted: impl Fn(&LinkEvent) -> bool,
) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for link event")
}

async fn next_message(events: &mut UnboundedReceiver<LinkEvent>) -> Message {
    match next_event(events, |e| matches!(e, LinkEvent::Message(_))).await {
        LinkEvent::Message(message) => message,
        other => panic!("unexpected event {:?}", other),
    }
}

fn app_message(n: u32) -> Message {
    Message::new(APP_ID, Bytes::copy_from_slice(&n.to_le_bytes()))
}

#[tokio::test]
async fn test_enforced_bring_up_and_echo() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );

    assert_eq!(link.bring_up().await.unwrap(), LinkState::Established);
    assert_eq!(link.state(), LinkState::Established);
    assert!(link.is_secure(APP_ID));
    assert!(!link.is_secure(msg_id::SL_EXCHANGE_PUB_KEYS_REQ));
    // The configuration carve-out ends with the configuration request
    assert!(link.is_secure(msg_id::SL_CONFIGURE_REQ));
    assert_eq!(link.policy(), CommandPolicy::new());

    link.send(app_message(7)).await.unwrap();
    let echo = next_message(&mut events).await;
    assert_eq!(echo, app_message(7));

    let counters = device.counters();
    assert_eq!(counters.key_exchanges, 1);
    assert_eq!(counters.configures, 1);
    assert_eq!(counters.encrypted_received, 1);
    // The device keeps configuration requests encrypted
    assert_eq!(device.policy(), CommandPolicy::new());
    assert!(device.policy().requires_encryption(msg_id::SL_CONFIGURE_REQ));

    let stats = link.stats();
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.encrypted_sent, 1);
    // Configuration confirmation and the echo
    assert_eq!(stats.encrypted_received, 2);
    assert_eq!(stats.policy_violations, 0);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_legacy_status_is_success() {
    let (link, _events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::LegacyStatus),
    );
    assert_eq!(link.bring_up().await.unwrap(), LinkState::Established);
    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rekey_delivers_every_message_once() {
    let config = LinkConfig {
        nonce_counter_max: 8,
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let (link, mut events, device) = setup(config, device_config(DeviceBehavior::Normal));
    link.bring_up().await.unwrap();

    for n in 0..12 {
        link.send(app_message(n)).await.unwrap();
    }
    for n in 0..12 {
        assert_eq!(next_message(&mut events).await, app_message(n));
    }

    assert_eq!(link.stats().rekeys, 1);
    assert_eq!(link.state(), LinkState::Established);
    assert_eq!(device.counters().key_exchanges, 2);
    assert_eq!(device.counters().decode_failures, 0);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_messages_queued_during_rekey_are_held() {
    let config = LinkConfig {
        nonce_counter_max: 4,
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let (link, mut events, device) = setup(config, device_config(DeviceBehavior::Normal));
    let link = Arc::new(link);
    link.bring_up().await.unwrap();

    // Exhaust the transmit counter, then pile up senders behind the rekey
    for n in 0..3 {
        link.send(app_message(n)).await.unwrap();
    }
    let senders: Vec<_> = (3..10)
        .map(|n| {
            let link = link.clone();
            tokio::spawn(async move { link.send(app_message(n)).await })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(next_message(&mut events).await);
    }
    for n in 0..10 {
        assert!(received.contains(&app_message(n)), "message {} lost", n);
    }
    assert!(link.stats().rekeys >= 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_tag_fails_enforced_bring_up() {
    let config = LinkConfig {
        handshake_attempts: 2,
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let (link, _events, device) = setup(config, device_config(DeviceBehavior::WrongMac));

    let err = link.bring_up().await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Handshake(HandshakeError::AuthenticationFailed)
    ));
    assert_eq!(link.state(), LinkState::Failed);
    assert_eq!(link.stats().handshake_failures, 2);

    // No key was installed
    let frame = SecureFrame::encrypted(1, 0, Bytes::from(vec![0u8; 32])).unwrap();
    assert!(matches!(
        link.decode_if_required(frame),
        Err(LinkError::Decode(DecodeError::NoSession))
    ));
    assert!(matches!(
        link.send(app_message(1)).await,
        Err(LinkError::Failed)
    ));

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tampered_frame_is_an_authentication_failure() {
    let (link, _events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );
    link.bring_up().await.unwrap();

    let frame = SecureFrame::encrypted(1, 0, Bytes::from(vec![0u8; 32])).unwrap();
    assert!(matches!(
        link.decode_if_required(frame),
        Err(LinkError::Decode(DecodeError::AuthenticationFailed { seq: 0 }))
    ));
    assert_eq!(link.stats().auth_failures, 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_optional_mode_falls_back_when_device_is_silent() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::OptionalTrusted),
        device_config(DeviceBehavior::Silent),
    );

    assert_eq!(link.bring_up().await.unwrap(), LinkState::Unsecured);
    assert!(!link.is_secure(APP_ID));

    link.send(app_message(3)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(3));
    assert_eq!(device.counters().encrypted_received, 0);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_optional_mode_pushes_key_to_blank_device() {
    let blank = DeviceConfig {
        psk: PreSharedKey::default(),
        ..DeviceConfig::default()
    };
    let (link, mut events, device) = setup(link_config(LinkMode::OptionalTrusted), blank);

    assert_eq!(link.bring_up().await.unwrap(), LinkState::Established);
    assert!(link.policy().requires_encryption(msg_id::SL_CONFIGURE_REQ));
    assert_eq!(device.policy(), CommandPolicy::new());

    let counters = device.counters();
    assert_eq!(counters.mac_key_pushes, 1);
    assert_eq!(counters.configures, 1);
    assert_eq!(counters.encrypted_received, 1);

    link.send(app_message(5)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(5));

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_mode_sends_plain() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::Disabled),
        device_config(DeviceBehavior::Normal),
    );

    assert_eq!(link.bring_up().await.unwrap(), LinkState::Disabled);
    assert!(!link.is_secure(APP_ID));

    link.send(app_message(9)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(9));

    let counters = device.counters();
    assert_eq!(counters.key_exchanges, 0);
    assert_eq!(counters.plain_received, 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_rekey_degrades_the_link() {
    let config = LinkConfig {
        nonce_counter_max: 4,
        handshake_timeout: Duration::from_millis(100),
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let (link, mut events, device) = setup(config, device_config(DeviceBehavior::FailRekey));
    link.bring_up().await.unwrap();

    let mut state = link.subscribe_state();
    for n in 0..4 {
        link.send(app_message(n)).await.unwrap();
    }
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LinkState::Degraded),
    )
    .await
    .unwrap()
    .unwrap();

    // Frames sealed before the failed rekey still decode
    let mut echoes = Vec::new();
    let mut degraded = false;
    while echoes.len() < 4 || !degraded {
        match next_event(&mut events, |_| true).await {
            LinkEvent::Message(message) => echoes.push(message),
            LinkEvent::Degraded { .. } => degraded = true,
            _ => {}
        }
    }
    assert_eq!(echoes, (0..4).map(app_message).collect::<Vec<_>>());

    assert!(matches!(
        link.send(app_message(4)).await,
        Err(LinkError::SecureChannelLost { id: APP_ID })
    ));
    // Exempt traffic still flows
    link.send(Message::new(msg_id::ERROR_IND, Bytes::from_static(b"x")))
        .await
        .unwrap();

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_indications_and_policy_checks() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );
    link.bring_up().await.unwrap();

    // Exempt id sent encrypted: logged, still delivered
    let outdated = ErrorInd {
        kind: DeviceErrorKind::OutdatedSessionKey,
        data: Bytes::from_static(&[0x11, 0, 0, 0]),
    };
    device
        .send_indication(msg_id::ERROR_IND, outdated.to_message().body, true)
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, LinkEvent::DeviceError(_))).await;
    assert_eq!(event, LinkEvent::DeviceError(outdated));

    // Policy-marked id in the clear: dropped
    device
        .send_indication(APP_ID, Bytes::from_static(b"sneaky"), false)
        .unwrap();
    next_event(&mut events, |e| matches!(e, LinkEvent::FrameDropped { .. })).await;

    let stats = link.stats();
    assert_eq!(stats.policy_violations, 2);
    assert_eq!(stats.frames_dropped, 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_key_errors_and_exceptions_are_decoded() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );
    link.bring_up().await.unwrap();

    let invalid = ErrorInd {
        kind: DeviceErrorKind::InvalidSessionKey,
        data: Bytes::new(),
    };
    device
        .send_indication(msg_id::ERROR_IND, invalid.to_message().body, false)
        .unwrap();
    match next_event(&mut events, |e| matches!(e, LinkEvent::DeviceError(_))).await {
        LinkEvent::DeviceError(indication) => {
            assert_eq!(indication.kind, DeviceErrorKind::InvalidSessionKey);
            assert!(indication.kind.is_session_key_error());
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Too short to carry an error type
    device
        .send_indication(msg_id::ERROR_IND, Bytes::from_static(&[3]), false)
        .unwrap();
    next_event(&mut events, |e| matches!(e, LinkEvent::FrameDropped { .. })).await;

    device
        .send_indication(msg_id::EXCEPTION_IND, Bytes::from_static(b"dump"), false)
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, LinkEvent::DeviceException { .. })).await;
    assert_eq!(
        event,
        LinkEvent::DeviceException {
            dump: Bytes::from_static(b"dump")
        }
    );

    let stats = link.stats();
    assert_eq!(stats.policy_violations, 0);
    assert_eq!(stats.frames_dropped, 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_bring_up_keeps_the_secure_link() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::OptionalTrusted),
        device_config(DeviceBehavior::FailRekey),
    );
    assert_eq!(link.bring_up().await.unwrap(), LinkState::Established);

    assert!(matches!(
        link.bring_up().await,
        Err(LinkError::NotReady(LinkState::Established))
    ));
    assert_eq!(link.state(), LinkState::Established);
    assert!(link.is_secure(APP_ID));

    link.send(app_message(11)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(11));

    let counters = device.counters();
    assert_eq!(counters.mac_key_pushes, 1);
    assert_eq!(counters.key_exchanges, 1);
    // Configuration request and the message, nothing else in the clear
    assert_eq!(counters.encrypted_received, 2);
    assert_eq!(counters.plain_received, 2);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_reply_to_abandoned_exchange_is_ignored() {
    let config = LinkConfig {
        handshake_attempts: 2,
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let device = device_config(DeviceBehavior::LateFirstReply(Duration::from_millis(250)));
    let (link, mut events, device) = setup(config, device);

    assert_eq!(link.bring_up().await.unwrap(), LinkState::Established);
    let stats = link.stats();
    assert_eq!(stats.handshake_failures, 1);
    assert_eq!(stats.handshakes, 1);

    // Both ends hold the key of the second exchange
    link.send(app_message(21)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(21));
    assert_eq!(link.stats().auth_failures, 0);

    let counters = device.counters();
    assert_eq!(counters.key_exchanges, 2);
    assert_eq!(counters.decode_failures, 0);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_traffic_alone_triggers_one_rekey() {
    let config = LinkConfig {
        nonce_counter_max: 4,
        ..link_config(LinkMode::MandatoryEnforced)
    };
    let (link, mut events, device) = setup(config, device_config(DeviceBehavior::Normal));
    link.bring_up().await.unwrap();

    for n in 0..4 {
        device.send_indication(APP_ID, app_message(n).body, true).unwrap();
    }
    let mut received = Vec::new();
    let mut rekeyed = false;
    while received.len() < 4 || !rekeyed {
        match next_event(&mut events, |_| true).await {
            LinkEvent::Message(message) => received.push(message),
            LinkEvent::Rekeyed => rekeyed = true,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(received, (0..4).map(app_message).collect::<Vec<_>>());

    let stats = link.stats();
    assert_eq!(stats.rekeys, 1);
    assert_eq!(stats.encrypted_sent, 0);
    assert_eq!(link.state(), LinkState::Established);
    assert_eq!(device.counters().key_exchanges, 2);

    link.send(app_message(9)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(9));
    assert_eq!(link.stats().rekeys, 1);

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_requested_rekey() {
    let (link, mut events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );
    link.bring_up().await.unwrap();

    link.request_rekey().unwrap();
    next_event(&mut events, |e| *e == LinkEvent::Rekeyed).await;
    assert_eq!(device.counters().key_exchanges, 2);

    link.send(app_message(1)).await.unwrap();
    assert_eq!(next_message(&mut events).await, app_message(1));

    link.shutdown().await;
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_the_link() {
    let (link, _events, device) = setup(
        link_config(LinkMode::MandatoryEnforced),
        device_config(DeviceBehavior::Normal),
    );
    link.bring_up().await.unwrap();
    link.shutdown().await;

    assert!(matches!(
        link.send(app_message(1)).await,
        Err(LinkError::Closed)
    ));
    assert!(matches!(link.bring_up().await, Err(LinkError::Closed)));
    device.shutdown().await.unwrap();
}
