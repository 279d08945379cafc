// ── In-process transport ──
//
// Records every publish and lets callers inject inbound messages. Used
// for dry runs and for exercising the bridge without a broker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::{InboundMessage, MqttTransport, SUBSCRIPTION_CHANNEL_SIZE, topic_matches};
use crate::config::Qos;
use crate::error::CoreError;

/// One recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<PublishedMessage>>,
    routes: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
    connected: AtomicBool,
    connect_error: Option<String>,
    changed: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose `connect` always fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            connect_error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Published messages whose topic matches `filter`.
    pub fn published_to(&self, filter: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    /// Deliver a message to every matching subscription.
    /// Returns how many subscribers received it.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage {
            topic: topic.to_owned(),
            payload: payload.into(),
        };
        let targets: Vec<mpsc::Sender<InboundMessage>> = lock(&self.routes)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, tx)| tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Wait until a message matching `filter` has been published.
    pub async fn wait_for(&self, filter: &str, timeout: Duration) -> Option<PublishedMessage> {
        self.wait_for_count(filter, 1, timeout)
            .await
            .and_then(|mut found| found.pop())
    }

    /// Wait until at least `count` messages matching `filter` exist; returns them.
    pub async fn wait_for_count(
        &self,
        filter: &str,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<PublishedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = self.published_to(filter);
            if found.len() >= count {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Wait until something has subscribed to a filter matching `topic`.
    pub async fn wait_for_subscriber(&self, topic: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&self.routes)
                .iter()
                .any(|(filter, _)| topic_matches(filter, topic))
            {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[async_trait]
impl MqttTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), CoreError> {
        if let Some(reason) = &self.connect_error {
            return Err(CoreError::MqttConnect {
                broker: "memory".into(),
                reason: reason.clone(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), CoreError> {
        if !self.is_connected() {
            return Err(CoreError::Mqtt {
                message: "not connected".into(),
            });
        }
        debug!(topic, bytes = payload.len(), retain, "publish");
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_owned(),
            payload,
            qos,
            retain,
        });
        self.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: Qos,
    ) -> Result<mpsc::Receiver<InboundMessage>, CoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        lock(&self.routes).push((filter.to_owned(), tx));
        self.changed.notify_waiters();
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.routes).clear();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_and_routes_injections() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();

        let mut rx = transport.subscribe("cmd/#", Qos::AtLeastOnce).await.unwrap();
        assert_eq!(transport.inject("cmd/a", "hello").await, 1);
        assert_eq!(transport.inject("other", "nope").await, 0);
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"hello"));

        transport
            .publish("out/x", Bytes::from_static(b"{}"), Qos::AtMostOnce, true)
            .await
            .unwrap();
        let got = transport
            .wait_for("out/+", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.retain);
        assert_eq!(got.json().unwrap(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn refusing_transport_fails_connect() {
        let transport = MemoryTransport::refusing("bad credentials");
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(
            transport
                .publish("t", Bytes::new(), Qos::AtMostOnce, false)
                .await
                .is_err()
        );
    }
}
