// ── rumqttc transport ──
//
// Wraps `rumqttc::AsyncClient`. A background task drives the event loop,
// reports the first CONNACK back to `connect()`, routes inbound publishes
// to subscription channels and re-subscribes after every reconnect.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InboundMessage, MqttTransport, SUBSCRIPTION_CHANNEL_SIZE, topic_matches};
use crate::config::{MqttConfig, MqttTls, Qos};
use crate::error::CoreError;

const CLIENT_CHANNEL_SIZE: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Route {
    filter: String,
    qos: QoS,
    tx: mpsc::Sender<InboundMessage>,
}

type Routes = Arc<StdMutex<Vec<Route>>>;

pub struct RumqttTransport {
    config: MqttConfig,
    client: Mutex<Option<AsyncClient>>,
    routes: Routes,
    cancel: Mutex<CancellationToken>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            routes: Arc::new(StdMutex::new(Vec::new())),
            cancel: Mutex::new(CancellationToken::new()),
            poller: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let cfg = &self.config;
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(cfg.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(cfg.max_packet_size, cfg.max_packet_size);
        if let Some(creds) = &cfg.credentials {
            options.set_credentials(creds.username.clone(), creds.password.expose_secret());
        }
        if cfg.tls == MqttTls::SystemRoots {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    async fn client(&self) -> Result<AsyncClient, CoreError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| CoreError::Mqtt {
                message: "not connected".into(),
            })
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn connect(&self) -> Result<(), CoreError> {
        let broker = self.config.broker();
        let (client, eventloop) = AsyncClient::new(self.options(), CLIENT_CHANNEL_SIZE);

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();

        let (connack_tx, connack_rx) = oneshot::channel();
        let handle = tokio::spawn(event_loop_task(
            eventloop,
            client.clone(),
            Arc::clone(&self.routes),
            cancel.clone(),
            connack_tx,
        ));

        let outcome = match tokio::time::timeout(self.config.connect_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(reason),
            Ok(Err(_)) => Err("event loop ended before CONNACK".to_owned()),
            Err(_) => Err(format!(
                "no CONNACK within {}s",
                self.config.connect_timeout.as_secs()
            )),
        };

        match outcome {
            Ok(()) => {
                info!(broker = %broker, client_id = %self.config.client_id, "MQTT connected");
                *self.client.lock().await = Some(client);
                *self.poller.lock().await = Some(handle);
                Ok(())
            }
            Err(reason) => {
                cancel.cancel();
                let _ = handle.await;
                Err(CoreError::MqttConnect { broker, reason })
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), CoreError> {
        let client = self.client().await?;
        // The client channel stops draining while the broker is away.
        let request = client.publish_bytes(topic, to_rumqttc(qos), retain, payload);
        match tokio::time::timeout(self.config.publish_timeout, request).await {
            Ok(result) => result.map_err(|e| CoreError::Mqtt {
                message: format!("publish to {topic} failed: {e}"),
            }),
            Err(_) => Err(CoreError::Mqtt {
                message: format!(
                    "publish to {topic} timed out after {}s",
                    self.config.publish_timeout.as_secs_f32()
                ),
            }),
        }
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
    ) -> Result<mpsc::Receiver<InboundMessage>, CoreError> {
        let qos = to_rumqttc(qos);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);
        let client = self.client().await?;
        let request = client.subscribe(filter, qos);
        match tokio::time::timeout(self.config.publish_timeout, request).await {
            Ok(result) => result.map_err(|e| CoreError::Mqtt {
                message: format!("subscribe to {filter} failed: {e}"),
            })?,
            Err(_) => {
                return Err(CoreError::Mqtt {
                    message: format!("subscribe to {filter} timed out"),
                });
            }
        }
        lock_routes(&self.routes).push(Route {
            filter: filter.to_owned(),
            qos,
            tx,
        });
        debug!(filter, "MQTT subscribed");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        if let Some(client) = self.client.lock().await.take() {
            // Never wait on a full request channel.
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "MQTT disconnect request failed (non-fatal)");
            }
        }
        self.cancel.lock().await.cancel();
        if let Some(handle) = self.poller.lock().await.take() {
            let _ = handle.await;
        }
        lock_routes(&self.routes).clear();
        info!(broker = %self.config.broker(), "MQTT disconnected");
        Ok(())
    }
}

// ── Event loop ───────────────────────────────────────────────────

async fn event_loop_task(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    cancel: CancellationToken,
    connack: oneshot::Sender<Result<(), String>>,
) {
    let mut connack = Some(connack);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(tx) = connack.take() {
                        let _ = tx.send(Ok(()));
                    } else {
                        info!("MQTT reconnected, restoring subscriptions");
                        resubscribe(&client, &routes);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    route_publish(&routes, &publish.topic, publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(tx) = connack.take() {
                        let _ = tx.send(Err(e.to_string()));
                        break;
                    }
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    debug!("MQTT event loop stopped");
}

fn resubscribe(client: &AsyncClient, routes: &Routes) {
    for route in lock_routes(routes).iter() {
        if let Err(e) = client.try_subscribe(route.filter.clone(), route.qos) {
            warn!(error = %e, filter = %route.filter, "resubscribe failed");
        }
    }
}

fn route_publish(routes: &Routes, topic: &str, payload: Bytes) {
    let mut guard = lock_routes(routes);
    guard.retain(|route| !route.tx.is_closed());
    for route in guard.iter().filter(|r| topic_matches(&r.filter, topic)) {
        let message = InboundMessage {
            topic: topic.to_owned(),
            payload: payload.clone(),
        };
        if let Err(e) = route.tx.try_send(message) {
            warn!(error = %e, topic, "inbound MQTT message dropped");
        }
    }
}

fn lock_routes(routes: &Routes) -> std::sync::MutexGuard<'_, Vec<Route>> {
    routes
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn to_rumqttc(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}
