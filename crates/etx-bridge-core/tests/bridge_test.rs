#![allow(clippy::unwrap_used)]

// End-to-end tests: a real loopback UDP socket in front of the controller,
// an in-memory MQTT transport behind it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use etx_bridge_core::codec::{END_MARKER, START_MARKER};
use etx_bridge_core::{BridgeConfig, BridgeController, BridgeState, MemoryTransport};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::UdpSocket;

const WAIT: Duration = Duration::from_secs(3);

fn frame(dn: u64, samples: &[i32]) -> Vec<u8> {
    let mut out = START_MARKER.to_vec();
    out.extend_from_slice(&dn.to_le_bytes()[..6]);
    out.push(u8::try_from(samples.len()).unwrap());
    out.extend_from_slice(&1_700_000_000_u32.to_le_bytes());
    out.extend_from_slice(&500_u16.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out.extend_from_slice(&[0u8; 36]);
    out.extend_from_slice(&END_MARKER);
    out
}

fn config() -> BridgeConfig {
    let mut config = BridgeConfig {
        agent_id: "agent-e2e".into(),
        ..BridgeConfig::default()
    };
    config.udp.listen = SocketAddr::from(([127, 0, 0, 1], 0));
    config.batch.max_items = 1;
    config
}

async fn running(config: BridgeConfig) -> (BridgeController, Arc<MemoryTransport>, UdpSocket, SocketAddr) {
    let transport = Arc::new(MemoryTransport::new());
    let controller = BridgeController::with_transport(config, transport.clone());
    controller.start().await.unwrap();
    let target = controller.local_addr().await.unwrap();
    let sensor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    (controller, transport, sensor, target)
}

// ── Sensor path ──────────────────────────────────────────────────

#[tokio::test]
async fn frame_is_published_parsed_raw_and_registered() {
    let mut cfg = config();
    cfg.topics.publish_parsed = true;
    let (controller, transport, sensor, target) = running(cfg).await;

    let bytes = frame(0xAABB_CCDD_EEFF, &[1234]);
    sensor.send_to(&bytes, target).await.unwrap();

    let parsed = transport
        .wait_for("etx/v1/parsed/AABBCCDDEEFF", WAIT)
        .await
        .unwrap();
    let body = parsed.json().unwrap();
    assert_eq!(body["dn"], "AABBCCDDEEFF");
    assert_eq!(body["sn"], 1);
    assert_eq!(body["p"], json!([1234]));
    assert_eq!(body["mag"], json!([0.0, 0.0, 0.0]));
    assert_eq!(body["gyro"], json!([0.0, 0.0, 0.0]));
    assert_eq!(body["acc"], json!([0.0, 0.0, 0.0]));

    let raw = transport.wait_for("etx/v1/raw", WAIT).await.unwrap();
    assert_eq!(raw.payload.as_ref(), bytes.as_slice());

    assert_eq!(
        controller.registry().resolve("AABBCCDDEEFF"),
        Some(IpAddr::from([127, 0, 0, 1]))
    );

    controller.stop().await;
}

#[tokio::test]
async fn unknown_peer_gets_bootstrap_subscribe() {
    let (controller, _transport, sensor, target) = running(config()).await;

    sensor
        .send_to(&frame(0x0000_0000_0001, &[]), target)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(WAIT, sensor.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"GCU_SUBSCRIBE");
    assert_eq!(from, target);

    controller.stop().await;
}

#[tokio::test]
async fn control_tokens_never_reach_the_raw_topic() {
    let (controller, transport, sensor, target) = running(config()).await;

    sensor.send_to(b"gcu_ack", target).await.unwrap();
    let bytes = frame(0x0A0B_0C0D_0E0F, &[5]);
    sensor.send_to(&bytes, target).await.unwrap();

    let raw = transport.wait_for("etx/v1/raw", WAIT).await.unwrap();
    assert_eq!(raw.payload.as_ref(), bytes.as_slice());
    assert_eq!(transport.published_to("etx/v1/raw").len(), 1);

    controller.stop().await;
}

#[tokio::test]
async fn stop_flushes_the_partial_raw_batch() {
    let mut cfg = config();
    cfg.batch.max_items = 50;
    cfg.batch.max_wait = Duration::from_secs(60);
    let (controller, transport, sensor, target) = running(cfg).await;

    let first = frame(0x1111_1111_1111, &[1]);
    let second = frame(0x2222_2222_2222, &[2]);
    sensor.send_to(&first, target).await.unwrap();
    sensor.send_to(&second, target).await.unwrap();

    // Raw-only runs still track devices from the frame header.
    let deadline = tokio::time::Instant::now() + WAIT;
    while controller.registry().resolve("222222222222").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "second frame never consumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.published_to("etx/v1/raw").is_empty());

    controller.stop().await;

    let raw = transport.published_to("etx/v1/raw");
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].payload.as_ref(), [first, second].concat().as_slice());
    assert_eq!(controller.state(), BridgeState::Idle);
}

#[tokio::test]
async fn parse_errors_surface_in_metrics() {
    let mut cfg = config();
    cfg.topics.publish_parsed = true;
    cfg.stats_interval = Duration::from_millis(50);
    let (controller, transport, sensor, target) = running(cfg).await;
    let mut states = controller.state_stream();

    sensor.send_to(&[0x5A, 0x5A, 0x01], target).await.unwrap();

    let state = tokio::time::timeout(
        WAIT,
        states.wait_for(|s| matches!(s, BridgeState::Running(m) if m.parse_errors >= 1)),
    )
    .await
    .unwrap()
    .unwrap();
    let BridgeState::Running(metrics) = state else {
        panic!("expected running state");
    };
    assert_eq!(metrics.packets_in, 1);
    assert_eq!(metrics.parsed_published, 0);
    assert!(transport.published_to("etx/v1/parsed/#").is_empty());

    controller.stop().await;
}

#[tokio::test]
async fn datagrams_are_mirrored_to_the_local_forward() {
    let mirror = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = config();
    cfg.udp.forward = Some(mirror.local_addr().unwrap());
    cfg.gcu.enabled = false;
    let (controller, transport, sensor, target) = running(cfg).await;

    let bytes = frame(0x0102_0304_0506, &[9]);
    sensor.send_to(&bytes, target).await.unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = tokio::time::timeout(WAIT, mirror.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], bytes.as_slice());
    transport.wait_for("etx/v1/raw", WAIT).await.unwrap();

    controller.stop().await;
}

// ── MQTT side ────────────────────────────────────────────────────

#[tokio::test]
async fn directory_snapshot_is_retained() {
    let (controller, transport, sensor, target) = running(config()).await;

    let first = transport
        .wait_for("etx/v1/config/agents/agent-e2e", WAIT)
        .await
        .unwrap();
    assert!(first.retain);
    assert_eq!(first.json().unwrap()["device_count"], 0);

    sensor
        .send_to(&frame(0xAABB_CCDD_EEFF, &[1]), target)
        .await
        .unwrap();
    transport.wait_for("etx/v1/raw", WAIT).await.unwrap();
    controller.stop().await;

    // The directory loop publishes on start; restart to force a fresh snapshot.
    controller.start().await.unwrap();
    let snapshots = transport
        .wait_for_count("etx/v1/config/agents/agent-e2e", 2, WAIT)
        .await
        .unwrap();
    let latest = snapshots.last().unwrap().json().unwrap();
    assert_eq!(latest["agent_id"], "agent-e2e");
    assert_eq!(latest["devices"][0]["dn"], "AABBCCDDEEFF");
    assert_eq!(latest["devices"][0]["ip"], "127.0.0.1");

    controller.stop().await;
}

#[tokio::test]
async fn mqtt_command_gets_exactly_one_result() {
    let (controller, transport, _sensor, _target) = running(config()).await;
    assert!(
        transport
            .wait_for_subscriber("etx/v1/config/cmd", WAIT)
            .await
    );

    let command = json!({"command_id": "cmd-1", "target_dn": "AABBCCDDEEFF", "analog": 2});
    assert_eq!(
        transport
            .inject("etx/v1/config/cmd", command.to_string())
            .await,
        1
    );

    let result = transport
        .wait_for("etx/v1/config/result/agent-e2e/cmd-1", WAIT)
        .await
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(result["status"], "error");
    assert_eq!(result["error"], "no IP associated with device id");
    assert_eq!(result["agent_id"], "agent-e2e");

    controller.stop().await;
    assert_eq!(transport.published_to("etx/v1/config/result/#").len(), 1);
}
