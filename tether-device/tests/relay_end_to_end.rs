//! Devices talking to a real relay over loopback sockets.

use std::net::SocketAddr;
use std::time::Duration;

use k9::assert_equal;
use serde_json::json;
use tokio::time::timeout;

use tether_device::{Device, DeviceConfig, DeviceError, DeviceEvent, SessionError};
use tether_proto::{Channel, DeviceType, ErrorCode, MessageKind};
use tether_relay::{RelayConfig, RelayEvent, RelayServer};

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_relay(config: RelayConfig) -> RelayServer {
    RelayServer::bind(config)
        .await
        .expect("relay should bind on loopback")
}

fn udp_config(relay: SocketAddr, device_type: DeviceType, channel: &str) -> DeviceConfig {
    DeviceConfig {
        relay_host: relay.ip().to_string(),
        port: relay.port(),
        channel: Channel::from(channel),
        device_type,
        keepalive_ms: 0,
        register_retry_ms: 200,
        ..DeviceConfig::default()
    }
}

fn tcp_config(relay: SocketAddr, device_type: DeviceType, channel: &str) -> DeviceConfig {
    DeviceConfig {
        udp: false,
        tcp: true,
        ..udp_config(relay, device_type, channel)
    }
}

async fn connect(config: DeviceConfig) -> Device {
    let mut device = Device::connect(config).await.expect("device connects");
    timeout(WAIT, device.wait_registered())
        .await
        .expect("registration timed out")
        .expect("device registers");
    device
}

async fn next_event(device: &mut Device) -> DeviceEvent {
    timeout(WAIT, device.next_event())
        .await
        .expect("timed out waiting for device event")
        .expect("device event stream ended")
}

/// Skip the initial `Registered` event.
async fn skip_registered(device: &mut Device) {
    match next_event(device).await {
        DeviceEvent::Registered { .. } => {}
        other => panic!("expected registration, got {other:?}"),
    }
}

#[tokio::test]
async fn controller_command_reaches_toy_exactly_once() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let addr = relay.udp_addr().unwrap();

    let mut toy = connect(udp_config(addr, DeviceType::Toy, "ch1")).await;
    let controller = connect(udp_config(addr, DeviceType::Controller, "ch1")).await;
    skip_registered(&mut toy).await;

    controller.command(json!("go")).await.unwrap();

    match next_event(&mut toy).await {
        DeviceEvent::Command { data, .. } => { assert_equal!(data, json!("go")); }
        other => panic!("expected command, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(300), toy.next_event())
        .await
        .is_err());

    toy.close().await;
    controller.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn status_crosses_transports() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let ws_url = format!("ws://{}/ws", relay.ws_addr().unwrap());

    let mut controller = connect(DeviceConfig {
        udp: false,
        ws_url: Some(ws_url),
        channel: Channel::from("lab"),
        device_type: DeviceType::Controller,
        keepalive_ms: 0,
        ..DeviceConfig::default()
    })
    .await;
    let toy = connect(tcp_config(relay.tcp_addr().unwrap(), DeviceType::Toy, "lab")).await;
    skip_registered(&mut controller).await;

    let seq = toy.status(json!({"battery": 91})).await.unwrap();

    assert_equal!(
        next_event(&mut controller).await,
        DeviceEvent::Status {
            seq,
            data: json!({"battery": 91}),
        }
    );

    toy.close().await;
    controller.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn forgotten_toy_registers_again() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let mut toy = connect(udp_config(relay.udp_addr().unwrap(), DeviceType::Toy, "1")).await;
    let first = toy.uid().unwrap();
    skip_registered(&mut toy).await;

    assert!(relay.handle().forget(first.clone()).await.unwrap());

    assert_equal!(timeout(WAIT, toy.ping()).await.unwrap(), None);
    match next_event(&mut toy).await {
        DeviceEvent::Error { code, .. } => { assert_equal!(code, ErrorCode::DeviceNotRegistered); }
        other => panic!("expected error, got {other:?}"),
    }
    let second = match next_event(&mut toy).await {
        DeviceEvent::Registered { uid, .. } => uid,
        other => panic!("expected registration, got {other:?}"),
    };
    assert!(second != first);
    assert!(relay.handle().get(second).await.unwrap().is_some());

    toy.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn ping_reports_round_trip() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let toy = connect(udp_config(relay.udp_addr().unwrap(), DeviceType::Toy, "1")).await;

    let rtt = timeout(WAIT, toy.ping()).await.unwrap();
    assert!(rtt.is_some());

    toy.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn sticky_status_replays_to_late_controller() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let addr = relay.udp_addr().unwrap();
    let mut relay_events = relay.subscribe();

    let toy = connect(udp_config(addr, DeviceType::Toy, "1")).await;
    toy.sticky_status(json!("door open")).await.unwrap();
    loop {
        match timeout(WAIT, relay_events.recv()).await.unwrap().unwrap() {
            RelayEvent::Status { .. } => break,
            _ => continue,
        }
    }

    let mut controller = connect(udp_config(addr, DeviceType::Controller, "1")).await;
    skip_registered(&mut controller).await;
    match next_event(&mut controller).await {
        DeviceEvent::Status { data, .. } => { assert_equal!(data, json!("door open")); }
        other => panic!("expected replayed status, got {other:?}"),
    }

    toy.close().await;
    controller.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn second_toy_evicts_first() {
    let relay = spawn_relay(RelayConfig {
        only_one_toy_per_channel: true,
        ..RelayConfig::loopback()
    })
    .await;
    let addr = relay.tcp_addr().unwrap();

    let mut first = connect(tcp_config(addr, DeviceType::Toy, "1")).await;
    skip_registered(&mut first).await;
    let second = connect(tcp_config(addr, DeviceType::Toy, "1")).await;

    // The relay closes the evicted connection, which ends the device.
    assert_equal!(timeout(WAIT, first.next_event()).await.unwrap(), None);
    assert_equal!(
        relay
            .handle()
            .get_all(DeviceType::Toy, Channel::from("1"))
            .await
            .unwrap(),
        vec![second.uid().unwrap()]
    );

    second.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn role_mismatch_never_leaves_the_process() {
    let relay = spawn_relay(RelayConfig::loopback()).await;
    let toy = connect(udp_config(relay.udp_addr().unwrap(), DeviceType::Toy, "1")).await;

    match toy.command(json!("go")).await {
        Err(DeviceError::Session(SessionError::RoleMismatch { kind, .. })) => {
            assert_equal!(kind, MessageKind::Command);
        }
        other => panic!("expected role mismatch, got {other:?}"),
    }

    toy.close().await;
    relay.close().await.unwrap();
}

#[tokio::test]
async fn register_retries_until_relay_appears() {
    // Reserve a port, release it, and start the relay there only after the
    // device has begun registering.
    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let mut toy = Device::connect(udp_config(addr, DeviceType::Toy, "1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_equal!(toy.uid(), None);

    let relay = spawn_relay(RelayConfig {
        udp_listen: Some(addr),
        tcp_listen: None,
        ws_listen: None,
        ..RelayConfig::default()
    })
    .await;

    let uid = timeout(WAIT, toy.wait_registered()).await.unwrap().unwrap();
    assert!(relay.handle().get(uid).await.unwrap().is_some());

    toy.close().await;
    relay.close().await.unwrap();
}
