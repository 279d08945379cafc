// etx-bridge-core: UDP sensor ingest, MQTT republishing and device command relay.

pub mod batcher;
pub mod codec;
pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    BatchConfig, BridgeConfig, DeviceConfig, DiscoveryConfig, GcuConfig, MqttConfig,
    MqttCredentials, MqttTls, OverflowPolicy, Qos, QueueConfig, RegistryConfig, Separator,
    TopicConfig, UdpConfig,
};
pub use controller::{BridgeController, BridgeState};
pub use error::CoreError;
pub use stats::BridgeMetrics;
pub use stream::StateStream;

// Wire types and the MQTT seam.
pub use codec::{FrameMetadata, SensorFrame};
pub use command::{CommandResult, CommandStatus};
pub use registry::{DeviceRegistry, RegistrySnapshot};
pub use transport::{InboundMessage, MemoryTransport, MqttTransport, RumqttTransport};
