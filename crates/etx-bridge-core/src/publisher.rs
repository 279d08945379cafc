// ── Topic publisher ──
//
// Binds the transport to the configured topics, QoS and agent id so the
// loops and the dispatcher publish documents without re-deriving topics.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::SensorFrame;
use crate::command::CommandResult;
use crate::config::{BridgeConfig, Qos, TopicConfig};
use crate::error::CoreError;
use crate::registry::{DeviceRegistry, RegistrySnapshot};
use crate::transport::MqttTransport;

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn MqttTransport>,
    topics: TopicConfig,
    agent_id: String,
    qos: Qos,
}

impl Publisher {
    pub fn new(config: &BridgeConfig, transport: Arc<dyn MqttTransport>) -> Self {
        Self {
            transport,
            topics: config.topics.clone(),
            agent_id: config.agent_id.clone(),
            qos: config.mqtt.qos,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Joined raw datagrams to the raw topic.
    pub async fn raw(&self, payload: Bytes) -> Result<(), CoreError> {
        self.transport
            .publish(&self.topics.raw, payload, self.qos, false)
            .await
    }

    /// One decoded frame to `<parsedPrefix>/<dn>`.
    pub async fn parsed(&self, frame: &SensorFrame) -> Result<(), CoreError> {
        let topic = self.topics.parsed_topic(&frame.dn);
        self.json(&topic, frame, false).await
    }

    /// Retained directory snapshot to `<agentTopic>/<agentId>`.
    pub async fn directory(&self, registry: &DeviceRegistry) -> Result<RegistrySnapshot, CoreError> {
        let snapshot = registry.snapshot(&self.agent_id);
        let topic = self.topics.agent_topic(&self.agent_id);
        self.json(&topic, &snapshot, true).await?;
        Ok(snapshot)
    }

    /// Command outcome to `<resultTopic>/<agentId>/<commandId>`.
    pub async fn result(&self, result: &CommandResult) -> Result<(), CoreError> {
        let topic = self.topics.result_topic(&self.agent_id, &result.command_id);
        self.json(&topic, result, false).await
    }

    async fn json<T: Serialize + Sync>(
        &self,
        topic: &str,
        body: &T,
        retain: bool,
    ) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(body).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.transport
            .publish(topic, Bytes::from(payload), self.qos, retain)
            .await
    }
}
