// ── UDP broadcast discovery ──
//
// Sends the discovery token to each broadcast target, then collects JSON
// replies until the deadline. Each reply is tagged with the sender IP in
// `from` and de-duplicated by (ip, mac, model, port).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::CoreError;

const MIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Ceiling for both the reply window and the gap between rounds.
pub const MAX_WINDOW: Duration = Duration::from_secs(60);

/// One discovery round.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryPlan {
    pub token: String,
    pub port: u16,
    pub attempts: u32,
    pub gap: Duration,
    pub timeout: Duration,
    pub targets: Vec<String>,
}

impl DiscoveryPlan {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            token: config.token.clone(),
            port: config.port,
            attempts: config.attempts,
            gap: config.gap,
            timeout: config.timeout,
            targets: config.broadcast_addrs.clone(),
        }
    }
}

/// Run discovery and return the de-duplicated replies.
pub async fn discover(plan: &DiscoveryPlan) -> Result<Vec<Value>, CoreError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.set_broadcast(true)?;

    let deadline = tokio::time::Instant::now() + plan.timeout.clamp(MIN_TIMEOUT, MAX_WINDOW);
    let gap = plan.gap.min(MAX_WINDOW);
    let targets: Vec<SocketAddr> = plan
        .targets
        .iter()
        .filter_map(|t| t.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, plan.port))
        .collect();

    for _ in 0..plan.attempts.max(1) {
        for target in &targets {
            if let Err(e) = socket.send_to(plan.token.as_bytes(), *target).await {
                debug!(error = %e, target = %target, "discovery send failed (non-fatal)");
            }
        }
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
    }

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut buf = [0u8; 1024];
    while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let Ok((len, from)) = received else { break };
        let Some(reply) = buf.get(..len).and_then(|bytes| annotate(bytes, from.ip())) else {
            continue;
        };
        if seen.insert(signature(&reply)) {
            found.push(reply);
        }
    }
    debug!(count = found.len(), "discovery finished");
    Ok(found)
}

/// Device id a reply advertises, taken from `dn`, `mac` or `device_code`.
pub fn reply_device_id(reply: &Value) -> Option<&str> {
    ["dn", "mac", "device_code"]
        .iter()
        .find_map(|key| reply.get(*key).and_then(Value::as_str))
}

/// Address a reply advertises, falling back to the sender.
pub fn reply_ip(reply: &Value) -> Option<IpAddr> {
    ["ip", "from"]
        .iter()
        .filter_map(|key| reply.get(*key).and_then(Value::as_str))
        .find_map(|s| s.parse().ok())
}

fn annotate(bytes: &[u8], from: IpAddr) -> Option<Value> {
    let mut reply: Value = serde_json::from_slice(bytes).ok()?;
    reply
        .as_object_mut()?
        .insert("from".into(), Value::String(from.to_string()));
    Some(reply)
}

fn signature(reply: &Value) -> String {
    ["ip", "mac", "model", "port"]
        .iter()
        .map(|key| reply.get(*key).map(Value::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}
