//! Configuration for the etx gateway.
//!
//! TOML file + `ETX_BRIDGE_*` environment overlay, load-time validation,
//! and translation to `etx_bridge_core::BridgeConfig`. The binary layers
//! its flag overrides on top of [`Config`] before translating.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use etx_bridge_core::config::{default_agent_id, short_hex};
use etx_bridge_core::{
    BatchConfig, BridgeConfig, DeviceConfig, DiscoveryConfig, GcuConfig, MqttConfig,
    MqttCredentials, MqttTls, OverflowPolicy, Qos, QueueConfig, RegistryConfig, Separator,
    TopicConfig, UdpConfig,
};

/// Environment prefix; nested keys are split on `__`
/// (`ETX_BRIDGE_MQTT__HOST` sets `mqtt.host`).
pub const ENV_PREFIX: &str = "ETX_BRIDGE_";

const MAX_TOKEN_LEN: usize = 64;
/// First byte of every binary sensor frame.
const FRAME_START_BYTE: u8 = 0x5A;
const REDACTED: &str = "********";
/// One hour; the batch window doubles as the consumer poll interval.
const MAX_BATCH_MS: u64 = 3_600_000;
const MAX_TIMEOUT_SECS: u64 = 3600;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Identity published on registry and result topics.
    /// Generated per run (`agent-<6 hex>`) when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub mqtt: MqttSection,
    pub udp: UdpSection,
    pub queue: QueueSection,
    pub batch: BatchSection,
    pub topics: TopicsSection,
    pub registry: RegistrySection,
    pub device: DeviceSection,
    pub gcu: GcuSection,
    pub discovery: DiscoverySection,
    pub stats: StatsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    /// Defaults to `udp-bridge-<host>-<6 hex>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub qos: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Plaintext password; prefer `password_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable holding the password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    pub tls: bool,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub max_packet_size: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            qos: 1,
            username: None,
            password: None,
            password_env: None,
            tls: false,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
            max_packet_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpSection {
    pub listen_addr: String,
    pub port: u16,
    pub recv_buffer: usize,
    /// Mirror every datagram to `forward_addr`.
    pub forward_local: bool,
    pub forward_addr: String,
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 13250,
            recv_buffer: 8192,
            forward_local: false,
            forward_addr: "127.0.0.1:53000".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSection {
    pub size: usize,
    /// Evict the oldest packet when full instead of rejecting the new one.
    pub drop_oldest: bool,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            size: 2000,
            drop_oldest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorMode {
    #[default]
    None,
    Newline,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSection {
    pub max_items: usize,
    pub max_ms: u64,
    pub separator: SeparatorMode,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_ms: 40,
            separator: SeparatorMode::None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TopicsSection {
    pub raw: String,
    pub publish_raw: bool,
    pub parsed_prefix: String,
    pub publish_parsed: bool,
    pub command: String,
    pub result_prefix: String,
    pub agent_prefix: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        let core = TopicConfig::default();
        Self {
            raw: core.raw,
            publish_raw: core.publish_raw,
            parsed_prefix: core.parsed_prefix,
            publish_parsed: core.publish_parsed,
            command: core.command,
            result_prefix: core.result_prefix,
            agent_prefix: core.agent_prefix,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySection {
    pub ttl_secs: u64,
    pub publish_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            publish_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    pub tcp_port: u16,
    pub timeout_ms: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            tcp_port: 22345,
            timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GcuSection {
    pub enabled: bool,
    pub subscribe_token: String,
    pub ack_token: String,
    pub broadcast_token: String,
    pub heartbeat_secs: u64,
    pub failover_secs: u64,
    pub broadcast_on_exit: bool,
}

impl Default for GcuSection {
    fn default() -> Self {
        Self {
            enabled: true,
            subscribe_token: "GCU_SUBSCRIBE".into(),
            ack_token: "GCU_ACK".into(),
            broadcast_token: "GCU_BROADCAST".into(),
            heartbeat_secs: 5,
            failover_secs: 20,
            broadcast_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub port: u16,
    pub token: String,
    pub attempts: u32,
    pub gap_ms: u64,
    pub timeout_ms: u64,
    pub broadcast: Vec<String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: 22346,
            token: "GCU_DISCOVER".into(),
            attempts: 2,
            gap_ms: 150,
            timeout_ms: 5000,
            broadcast: vec!["255.255.255.255".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsSection {
    pub interval_ms: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self { interval_ms: 2000 }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "etx", "etx-bridge").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("etx-bridge");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load defaults, then the TOML file, then the environment.
///
/// An explicit `path` must exist; the default path may be absent.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(explicit) if !explicit.exists() => {
            return Err(ConfigError::NotFound {
                path: explicit.to_path_buf(),
            });
        }
        Some(explicit) => explicit.to_path_buf(),
        None => config_path(),
    };

    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, cfg.to_toml()?)?;
    Ok(())
}

impl Config {
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some(REDACTED.into());
        }
        copy
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Check every constraint the bridge relies on at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if Qos::from_level(self.mqtt.qos).is_none() {
            return Err(invalid("mqtt.qos", format!("expected 0, 1 or 2, got {}", self.mqtt.qos)));
        }
        if self.mqtt.publish_timeout_secs == 0 {
            return Err(invalid("mqtt.publish_timeout_secs", "must be greater than 0"));
        }
        if self.mqtt.publish_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(invalid(
                "mqtt.publish_timeout_secs",
                format!("must be at most {MAX_TIMEOUT_SECS}"),
            ));
        }
        if self.queue.size == 0 {
            return Err(invalid("queue.size", "must be at least 1"));
        }
        if self.batch.max_items == 0 {
            return Err(invalid("batch.max_items", "must be at least 1"));
        }
        if self.batch.max_ms > MAX_BATCH_MS {
            return Err(invalid("batch.max_ms", format!("must be at most {MAX_BATCH_MS}")));
        }
        if self.registry.ttl_secs == 0 {
            return Err(invalid("registry.ttl_secs", "must be greater than 0"));
        }
        if self.registry.publish_secs == 0 {
            return Err(invalid("registry.publish_secs", "must be greater than 0"));
        }
        if self.discovery.attempts == 0 {
            return Err(invalid("discovery.attempts", "must be at least 1"));
        }
        for (field, topic) in [
            ("topics.raw", &self.topics.raw),
            ("topics.parsed_prefix", &self.topics.parsed_prefix),
            ("topics.command", &self.topics.command),
            ("topics.result_prefix", &self.topics.result_prefix),
            ("topics.agent_prefix", &self.topics.agent_prefix),
        ] {
            if topic.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }
        for addr in &self.discovery.broadcast {
            addr.parse::<IpAddr>()
                .map_err(|_| invalid("discovery.broadcast", format!("'{addr}' is not an IP address")))?;
        }
        self.listen_addr()?;
        self.forward_addr()?;
        self.validate_gcu()
    }

    fn validate_gcu(&self) -> Result<(), ConfigError> {
        let gcu = &self.gcu;
        if gcu.heartbeat_secs == 0 {
            return Err(invalid("gcu.heartbeat_secs", "must be at least 1"));
        }
        if gcu.failover_secs <= gcu.heartbeat_secs {
            return Err(invalid(
                "gcu.failover_secs",
                format!("must exceed gcu.heartbeat_secs ({})", gcu.heartbeat_secs),
            ));
        }

        let tokens = [
            ("gcu.subscribe_token", gcu.subscribe_token.trim()),
            ("gcu.ack_token", gcu.ack_token.trim()),
            ("gcu.broadcast_token", gcu.broadcast_token.trim()),
        ];
        for (field, token) in tokens {
            validate_token(field, token)?;
        }
        for (i, (field, token)) in tokens.iter().enumerate() {
            if tokens
                .iter()
                .skip(i + 1)
                .any(|(_, other)| other.eq_ignore_ascii_case(token))
            {
                return Err(invalid(field, "must differ from the other GCU tokens"));
            }
        }
        Ok(())
    }

    fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .udp
            .listen_addr
            .parse()
            .map_err(|_| invalid("udp.listen_addr", format!("'{}' is not an IP address", self.udp.listen_addr)))?;
        Ok(SocketAddr::new(ip, self.udp.port))
    }

    fn forward_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if !self.udp.forward_local {
            return Ok(None);
        }
        self.udp
            .forward_addr
            .parse()
            .map(Some)
            .map_err(|_| invalid("udp.forward_addr", format!("'{}' is not host:port", self.udp.forward_addr)))
    }

    fn credentials(&self) -> Result<Option<MqttCredentials>, ConfigError> {
        let Some(username) = self.mqtt.username.clone() else {
            return Ok(None);
        };
        let password = if let Some(env_name) = &self.mqtt.password_env {
            std::env::var(env_name)
                .map_err(|_| invalid("mqtt.password_env", format!("environment variable {env_name} is not set")))?
        } else {
            self.mqtt.password.clone().unwrap_or_default()
        };
        Ok(Some(MqttCredentials {
            username,
            password: SecretString::from(password),
        }))
    }

    // ── Translation ─────────────────────────────────────────────────

    /// Validate and build the core runtime configuration.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        self.validate()?;

        let mqtt = MqttConfig {
            host: self.mqtt.host.trim().to_owned(),
            port: self.mqtt.port,
            client_id: self
                .mqtt
                .client_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(default_client_id),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            qos: Qos::from_level(self.mqtt.qos).unwrap_or_default(),
            credentials: self.credentials()?,
            tls: if self.mqtt.tls {
                MqttTls::SystemRoots
            } else {
                MqttTls::Disabled
            },
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            publish_timeout: Duration::from_secs(self.mqtt.publish_timeout_secs),
            max_packet_size: self.mqtt.max_packet_size,
        };

        Ok(BridgeConfig {
            agent_id: self
                .agent_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(default_agent_id),
            mqtt,
            udp: UdpConfig {
                listen: self.listen_addr()?,
                recv_buffer: self.udp.recv_buffer,
                forward: self.forward_addr()?,
            },
            queue: QueueConfig {
                capacity: self.queue.size,
                overflow: if self.queue.drop_oldest {
                    OverflowPolicy::DropOldest
                } else {
                    OverflowPolicy::RejectNew
                },
            },
            batch: BatchConfig {
                max_items: self.batch.max_items,
                max_wait: Duration::from_millis(self.batch.max_ms),
                separator: match self.batch.separator {
                    SeparatorMode::None => Separator::None,
                    SeparatorMode::Newline => Separator::Newline,
                },
            },
            topics: TopicConfig {
                raw: self.topics.raw.clone(),
                parsed_prefix: self.topics.parsed_prefix.clone(),
                publish_raw: self.topics.publish_raw,
                publish_parsed: self.topics.publish_parsed,
                command: self.topics.command.clone(),
                result_prefix: self.topics.result_prefix.clone(),
                agent_prefix: self.topics.agent_prefix.clone(),
            },
            registry: RegistryConfig {
                ttl: Duration::from_secs(self.registry.ttl_secs),
                publish_interval: Duration::from_secs(self.registry.publish_secs),
            },
            device: DeviceConfig {
                tcp_port: self.device.tcp_port,
                timeout: Duration::from_millis(self.device.timeout_ms),
            },
            gcu: GcuConfig {
                enabled: self.gcu.enabled,
                subscribe_token: self.gcu.subscribe_token.trim().to_owned(),
                ack_token: self.gcu.ack_token.trim().to_owned(),
                broadcast_token: self.gcu.broadcast_token.trim().to_owned(),
                heartbeat_interval: Duration::from_secs(self.gcu.heartbeat_secs),
                failover: Duration::from_secs(self.gcu.failover_secs),
                broadcast_on_exit: self.gcu.broadcast_on_exit,
            },
            discovery: DiscoveryConfig {
                port: self.discovery.port,
                token: self.discovery.token.clone(),
                attempts: self.discovery.attempts,
                gap: Duration::from_millis(self.discovery.gap_ms),
                timeout: Duration::from_millis(self.discovery.timeout_ms),
                broadcast_addrs: self.discovery.broadcast.clone(),
            },
            stats_interval: Duration::from_millis(self.stats.interval_ms),
        })
    }
}

/// A control token shares the sensor socket, so it must be short
/// printable ASCII and must not look like the start of a binary frame.
fn validate_token(field: &str, token: &str) -> Result<(), ConfigError> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(invalid(field, format!("must be 1-{MAX_TOKEN_LEN} bytes")));
    }
    if !token.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(invalid(field, "must be printable ASCII"));
    }
    if token.as_bytes().first().is_some_and(|b| b.eq_ignore_ascii_case(&FRAME_START_BYTE)) {
        return Err(invalid(
            field,
            "must not start with 'Z' (collides with the frame start marker)",
        ));
    }
    Ok(())
}

/// `udp-bridge-<host>-<6 hex>`, or `udp-bridge-<6 hex>` without a hostname.
pub fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| {
            h.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .filter(|h| !h.is_empty());
    match host {
        Some(host) => format!("udp-bridge-{host}-{}", short_hex()),
        None => format!("udp-bridge-{}", short_hex()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_translate_to_core_defaults() {
        let bridge = Config::default().to_bridge_config().unwrap();
        assert_eq!(bridge.mqtt.broker(), "127.0.0.1:1883");
        assert!(bridge.mqtt.client_id.starts_with("udp-bridge-"));
        assert!(bridge.agent_id.starts_with("agent-"));
        assert_eq!(bridge.udp.listen, "0.0.0.0:13250".parse().unwrap());
        assert_eq!(bridge.udp.forward, None);
        assert_eq!(bridge.queue.capacity, 2000);
        assert_eq!(bridge.queue.overflow, OverflowPolicy::DropOldest);
        assert_eq!(bridge.batch.max_wait, Duration::from_millis(40));
        assert_eq!(bridge.registry.ttl, Duration::from_secs(300));
        assert_eq!(bridge.device.timeout, Duration::from_secs(3));
        assert_eq!(bridge.gcu.failover, Duration::from_secs(20));
        assert_eq!(bridge.discovery.broadcast_addrs, vec!["255.255.255.255".to_owned()]);
        assert_eq!(bridge.stats_interval, Duration::from_millis(2000));
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
agent_id = "agent-lab"

[mqtt]
host = "broker.lan"
port = 8883
qos = 2
tls = true
username = "bridge"
password = "hunter2"

[udp]
port = 14000
forward_local = true

[queue]
drop_oldest = false

[batch]
separator = "newline"

[topics]
publish_parsed = true
"#,
        );

        let cfg = load_config(Some(file.path())).unwrap();
        let bridge = cfg.to_bridge_config().unwrap();

        assert_eq!(bridge.agent_id, "agent-lab");
        assert_eq!(bridge.mqtt.broker(), "broker.lan:8883");
        assert_eq!(bridge.mqtt.qos, Qos::ExactlyOnce);
        assert_eq!(bridge.mqtt.tls, MqttTls::SystemRoots);
        let creds = bridge.mqtt.credentials.unwrap();
        assert_eq!(creds.username, "bridge");
        assert_eq!(creds.password.expose_secret(), "hunter2");
        assert_eq!(bridge.udp.listen.port(), 14000);
        assert_eq!(bridge.udp.forward, Some("127.0.0.1:53000".parse().unwrap()));
        assert_eq!(bridge.queue.overflow, OverflowPolicy::RejectNew);
        assert_eq!(bridge.batch.separator, Separator::Newline);
        assert!(bridge.topics.publish_parsed);
        // Untouched sections keep their defaults.
        assert_eq!(bridge.device.tcp_port, 22345);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/etx-bridge.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn malformed_file_is_a_figment_error() {
        let file = write_config("[queue]\nsize = \"lots\"\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Figment(_)));
    }

    #[test]
    fn tokens_must_not_collide_with_frames_or_each_other() {
        let mut cfg = Config::default();
        cfg.gcu.ack_token = "ZZ_ACK".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("gcu.ack_token"));

        let mut cfg = Config::default();
        cfg.gcu.ack_token = "gcu_subscribe".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.gcu.broadcast_token = "x".repeat(65);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.gcu.subscribe_token = "SUB\u{7f}".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        let cases: [(&str, fn(&mut Config)); 9] = [
            ("queue.size", |c| c.queue.size = 0),
            ("batch.max_items", |c| c.batch.max_items = 0),
            ("batch.max_ms", |c| c.batch.max_ms = u64::MAX),
            ("mqtt.publish_timeout_secs", |c| c.mqtt.publish_timeout_secs = 0),
            ("mqtt.publish_timeout_secs", |c| c.mqtt.publish_timeout_secs = u64::MAX),
            ("gcu.heartbeat_secs", |c| c.gcu.heartbeat_secs = 0),
            ("gcu.failover_secs", |c| c.gcu.failover_secs = c.gcu.heartbeat_secs),
            ("registry.ttl_secs", |c| c.registry.ttl_secs = 0),
            ("mqtt.qos", |c| c.mqtt.qos = 3),
        ];
        for (field, mutate) in cases {
            let mut cfg = Config::default();
            mutate(&mut cfg);
            let err = cfg.validate().unwrap_err();
            assert!(
                matches!(&err, ConfigError::Validation { field: f, .. } if f == field),
                "expected {field}, got {err}"
            );
        }
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let mut cfg = Config::default();
        cfg.udp.listen_addr = "not-an-ip".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.udp.forward_local = true;
        cfg.udp.forward_addr = "localhost".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.discovery.broadcast = vec!["10.0.0.255".into(), "everyone".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_password_env_is_reported() {
        let mut cfg = Config::default();
        cfg.mqtt.username = Some("bridge".into());
        cfg.mqtt.password_env = Some("ETX_BRIDGE_TEST_SURELY_UNSET_PASSWORD".into());
        let err = cfg.to_bridge_config().unwrap_err();
        assert!(err.to_string().contains("mqtt.password_env"));
    }

    #[test]
    fn redaction_and_round_trip() {
        let mut cfg = Config::default();
        cfg.mqtt.password = Some("hunter2".into());
        let shown = cfg.redacted().to_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains(REDACTED));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.mqtt.password.as_deref(), Some("hunter2"));
        assert_eq!(loaded.queue.size, 2000);
    }
}
