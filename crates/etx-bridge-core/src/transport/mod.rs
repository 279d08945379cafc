// ── MQTT capability ──
//
// The bridge only needs connect / publish / subscribe / disconnect from
// an MQTT client. `RumqttTransport` is the production implementation;
// `MemoryTransport` keeps everything in-process.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::Qos;
use crate::error::CoreError;

pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::RumqttTransport;

/// Capacity of each subscription channel.
pub const SUBSCRIPTION_CHANNEL_SIZE: usize = 64;

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Minimal MQTT client contract used by the bridge.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Establish the broker session. Failure is fatal for the run.
    async fn connect(&self) -> Result<(), CoreError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), CoreError>;

    /// Subscribe to `filter`; matching messages arrive on the returned channel.
    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
    ) -> Result<mpsc::Receiver<InboundMessage>, CoreError>;

    async fn disconnect(&self) -> Result<(), CoreError>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}
