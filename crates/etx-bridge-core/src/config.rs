// ── Runtime bridge configuration ──
//
// These types describe one bridge run: where to listen, where to publish,
// how to buffer. Core never touches disk or the environment; the config
// crate builds a `BridgeConfig` and hands it in.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use secrecy::SecretString;

// ── MQTT ─────────────────────────────────────────────────────────

/// MQTT delivery guarantee, mirrored from the protocol levels 0-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// Map a numeric protocol level to a `Qos`.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Broker credentials. The password never appears in `Debug` output.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Transport security for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MqttTls {
    #[default]
    Disabled,
    /// TLS verified against the platform root store.
    SystemRoots,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub qos: Qos,
    pub credentials: Option<MqttCredentials>,
    pub tls: MqttTls,
    /// How long to wait for the broker's CONNACK before failing the run.
    pub connect_timeout: Duration,
    /// Upper bound on handing one publish to the client, so a dead broker
    /// cannot stall the publishing loops.
    pub publish_timeout: Duration,
    pub max_packet_size: usize,
}

impl MqttConfig {
    /// `host:port` string used in logs and errors.
    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: format!("udp-bridge-{}", short_hex()),
            keep_alive: Duration::from_secs(30),
            qos: Qos::AtLeastOnce,
            credentials: None,
            tls: MqttTls::Disabled,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            max_packet_size: 1024 * 1024,
        }
    }
}

// ── UDP ingest ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub listen: SocketAddr,
    /// Size of the per-datagram receive buffer.
    pub recv_buffer: usize,
    /// Mirror every datagram to this address when set.
    pub forward: Option<SocketAddr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 13250)),
            recv_buffer: 8192,
            forward: None,
        }
    }
}

/// What `IngestQueue::offer` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the head and accept the new packet.
    #[default]
    DropOldest,
    /// Refuse the new packet; the caller counts it as dropped.
    RejectNew,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

// ── Raw batching ─────────────────────────────────────────────────

/// Joiner placed between payloads of one raw batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Separator {
    #[default]
    None,
    Newline,
}

impl Separator {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Newline => b"\n",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_items: usize,
    pub max_wait: Duration,
    pub separator: Separator,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_wait: Duration::from_millis(40),
            separator: Separator::None,
        }
    }
}

// ── Topics ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub raw: String,
    pub parsed_prefix: String,
    pub publish_raw: bool,
    pub publish_parsed: bool,
    pub command: String,
    pub result_prefix: String,
    pub agent_prefix: String,
}

impl TopicConfig {
    /// `<parsedPrefix>/<deviceId>`
    pub fn parsed_topic(&self, dn: &str) -> String {
        format!("{}/{dn}", self.parsed_prefix.trim_end_matches('/'))
    }

    /// `<agentTopic>/<agentId>`
    pub fn agent_topic(&self, agent_id: &str) -> String {
        format!("{}/{agent_id}", self.agent_prefix.trim_end_matches('/'))
    }

    /// `<resultTopic>/<agentId>/<commandId>`
    pub fn result_topic(&self, agent_id: &str, command_id: &str) -> String {
        format!(
            "{}/{agent_id}/{command_id}",
            self.result_prefix.trim_end_matches('/')
        )
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw: "etx/v1/raw".into(),
            parsed_prefix: "etx/v1/parsed".into(),
            publish_raw: true,
            publish_parsed: false,
            command: "etx/v1/config/cmd".into(),
            result_prefix: "etx/v1/config/result".into(),
            agent_prefix: "etx/v1/config/agents".into(),
        }
    }
}

// ── Registry & device link ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ttl: Duration,
    pub publish_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            publish_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub tcp_port: u16,
    /// Bound on connect and on reading the reply line.
    pub timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tcp_port: 22345,
            timeout: Duration::from_secs(3),
        }
    }
}

// ── GCU heartbeat ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GcuConfig {
    pub enabled: bool,
    pub subscribe_token: String,
    pub ack_token: String,
    pub broadcast_token: String,
    pub heartbeat_interval: Duration,
    pub failover: Duration,
    pub broadcast_on_exit: bool,
}

impl Default for GcuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subscribe_token: "GCU_SUBSCRIBE".into(),
            ack_token: "GCU_ACK".into(),
            broadcast_token: "GCU_BROADCAST".into(),
            heartbeat_interval: Duration::from_secs(5),
            failover: Duration::from_secs(20),
            broadcast_on_exit: true,
        }
    }
}

// ── Discovery ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub token: String,
    pub attempts: u32,
    pub gap: Duration,
    pub timeout: Duration,
    /// Broadcast targets used when a discover command names none.
    pub broadcast_addrs: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 22346,
            token: "GCU_DISCOVER".into(),
            attempts: 2,
            gap: Duration::from_millis(150),
            timeout: Duration::from_secs(5),
            broadcast_addrs: vec!["255.255.255.255".into()],
        }
    }
}

// ── BridgeConfig ─────────────────────────────────────────────────

/// Configuration for one bridge run.
///
/// Built by the config crate or the CLI, passed to `BridgeController`.
/// Immutable for the lifetime of a run; changes require a restart.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Identity this gateway publishes itself as.
    pub agent_id: String,
    pub mqtt: MqttConfig,
    pub udp: UdpConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub topics: TopicConfig,
    pub registry: RegistryConfig,
    pub device: DeviceConfig,
    pub gcu: GcuConfig,
    pub discovery: DiscoveryConfig,
    pub stats_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            mqtt: MqttConfig::default(),
            udp: UdpConfig::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            topics: TopicConfig::default(),
            registry: RegistryConfig::default(),
            device: DeviceConfig::default(),
            gcu: GcuConfig::default(),
            discovery: DiscoveryConfig::default(),
            stats_interval: Duration::from_millis(2000),
        }
    }
}

/// `agent-<6 hex>`, random per call.
pub fn default_agent_id() -> String {
    format!("agent-{}", short_hex())
}

/// Six lowercase hex characters from a fresh v4 UUID.
pub fn short_hex() -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(6);
    hex
}
