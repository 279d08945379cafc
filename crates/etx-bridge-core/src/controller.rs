// ── Bridge controller ──
//
// Lifecycle for one gateway: connect MQTT, bind the UDP socket, run the
// ingest/publish/registry/command loops under one cancellation scope,
// and expose the run state through a watch channel.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{RawBatch, RawBatcher};
use crate::codec;
use crate::command::CommandDispatcher;
use crate::config::BridgeConfig;
use crate::error::CoreError;
use crate::heartbeat::{HeartbeatManager, TokenSink};
use crate::publisher::Publisher;
use crate::queue::{IngestQueue, UdpPacket};
use crate::registry::DeviceRegistry;
use crate::stats::{BridgeCounters, BridgeMetrics, StatsReporter};
use crate::stream::StateStream;
use crate::transport::{MqttTransport, RumqttTransport};

const MIN_CONSUMER_POLL: Duration = Duration::from_millis(100);
const MIN_REGISTRY_PERIOD: Duration = Duration::from_millis(100);
const MIN_RECV_BUFFER: usize = 64;

// ── BridgeState ──────────────────────────────────────────────────

/// Run state observable by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, strum::IntoStaticStr)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BridgeState {
    Idle,
    Starting,
    Running(BridgeMetrics),
    Error(String),
}

impl BridgeState {
    /// `true` while a run is starting or live.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running(_))
    }

    pub fn label(&self) -> &'static str {
        self.into()
    }
}

// ── BridgeController ─────────────────────────────────────────────

/// Entry point for running the gateway.
///
/// Cheaply cloneable via `Arc<BridgeInner>`. At most one run is live at a
/// time; `start()` while running is a no-op.
#[derive(Clone)]
pub struct BridgeController {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    transport: Arc<dyn MqttTransport>,
    registry: Arc<DeviceRegistry>,
    state: watch::Sender<BridgeState>,
    cancel: CancellationToken,
    run: Mutex<Option<RunScope>>,
}

/// Everything owned by one live run.
struct RunScope {
    cancel: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    heartbeat: Option<Arc<HeartbeatManager>>,
    local_addr: SocketAddr,
}

impl BridgeController {
    /// Controller publishing through a rumqttc client built from `config.mqtt`.
    pub fn new(config: BridgeConfig) -> Self {
        let transport = Arc::new(RumqttTransport::new(config.mqtt.clone()));
        Self::with_transport(config, transport)
    }

    /// Controller over any MQTT transport. Does NOT start; call
    /// [`start()`](Self::start).
    pub fn with_transport(config: BridgeConfig, transport: Arc<dyn MqttTransport>) -> Self {
        let registry = Arc::new(DeviceRegistry::new(config.registry.ttl));
        let (state, _) = watch::channel(BridgeState::Idle);

        Self {
            inner: Arc::new(BridgeInner {
                config,
                transport,
                registry,
                state,
                cancel: CancellationToken::new(),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start a run.
    ///
    /// Connects MQTT, binds the UDP socket, subscribes to the command
    /// topic, then launches the loops. A failure here leaves the state at
    /// `Error` with the transport disconnected.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            debug!("start ignored, bridge already running");
            return Ok(());
        }

        self.inner.state.send_replace(BridgeState::Starting);
        info!(agent_id = %self.inner.config.agent_id, "bridge starting");

        match self.launch().await {
            Ok(scope) => {
                info!(udp = %scope.local_addr, "bridge running");
                *run = Some(scope);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "bridge failed to start");
                self.inner.state.send_replace(BridgeState::Error(e.to_string()));
                if let Err(de) = self.inner.transport.disconnect().await {
                    debug!(error = %de, "MQTT disconnect after failed start (non-fatal)");
                }
                Err(e)
            }
        }
    }

    /// Stop the current run and wait for it to drain.
    ///
    /// The final state is `Idle`, unless the run already failed.
    pub async fn stop(&self) {
        self.teardown().await;
    }

    // ── State observation ────────────────────────────────────────

    pub fn state(&self) -> BridgeState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.inner.state.subscribe()
    }

    pub fn state_stream(&self) -> StateStream {
        StateStream::new(self.inner.state.subscribe())
    }

    /// Address the UDP socket is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.run.lock().await.as_ref().map(|scope| scope.local_addr)
    }

    // ── Internals ────────────────────────────────────────────────

    async fn launch(&self) -> Result<RunScope, CoreError> {
        let config = &self.inner.config;
        let transport = Arc::clone(&self.inner.transport);

        transport.connect().await?;

        let socket = UdpSocket::bind(config.udp.listen)
            .await
            .map_err(|e| CoreError::Bind {
                addr: config.udp.listen.to_string(),
                reason: e.to_string(),
            })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let commands = transport
            .subscribe(&config.topics.command, config.mqtt.qos)
            .await?;
        let forward = match config.udp.forward {
            Some(target) => forward_socket(target).await,
            None => None,
        };

        let cancel = self.inner.cancel.child_token();
        let publisher = Publisher::new(config, transport);
        let registry = Arc::clone(&self.inner.registry);
        let counters = Arc::new(BridgeCounters::default());
        let queue = Arc::new(IngestQueue::new(config.queue.capacity, config.queue.overflow));

        let heartbeat = config.gcu.enabled.then(|| {
            let sink: Arc<dyn TokenSink> = socket.clone();
            Arc::new(HeartbeatManager::new(&config.gcu, sink))
        });

        self.inner
            .state
            .send_replace(BridgeState::Running(BridgeMetrics {
                updated_at: Utc::now(),
                ..BridgeMetrics::default()
            }));

        let mut task_handles = Vec::new();

        task_handles.push(tokio::spawn(registry_publish_task(
            publisher.clone(),
            Arc::clone(&registry),
            config.registry.publish_interval,
            cancel.clone(),
        )));

        let dispatcher = Arc::new(CommandDispatcher::new(
            config,
            publisher.clone(),
            Arc::clone(&registry),
        ));
        task_handles.push(self.spawn_loop("command", cancel.clone(), {
            let cancel = cancel.clone();
            async move {
                dispatcher.run(commands, cancel.clone()).await;
                if cancel.is_cancelled() {
                    Ok(())
                } else {
                    Err(CoreError::Mqtt {
                        message: "command subscription closed".into(),
                    })
                }
            }
        }));

        task_handles.push(self.spawn_loop(
            "udp-receive",
            cancel.clone(),
            udp_receive_task(UdpReceiver {
                socket,
                forward,
                heartbeat: heartbeat.clone(),
                queue: Arc::clone(&queue),
                counters: Arc::clone(&counters),
                buffer_len: config.udp.recv_buffer.max(MIN_RECV_BUFFER),
                cancel: cancel.clone(),
            }),
        ));

        let consumer = PublishConsumer {
            controller: self.clone(),
            publisher,
            registry,
            queue,
            counters,
            batcher: RawBatcher::new(&config.batch),
            reporter: StatsReporter::new(config.stats_interval),
            publish_raw: config.topics.publish_raw,
            publish_parsed: config.topics.publish_parsed,
        };
        let poll = config.batch.max_wait.max(MIN_CONSUMER_POLL);
        let drain_limit = config.mqtt.publish_timeout;
        task_handles.push(tokio::spawn(consumer.run(poll, drain_limit, cancel.clone())));

        if let Some(heartbeat) = &heartbeat {
            task_handles.push(tokio::spawn(Arc::clone(heartbeat).run(cancel.clone())));
        }

        Ok(RunScope {
            cancel,
            task_handles,
            heartbeat,
            local_addr,
        })
    }

    /// Spawn a loop whose error ends the run with `Error`.
    fn spawn_loop<F>(&self, name: &'static str, cancel: CancellationToken, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if !cancel.is_cancelled() {
                    error!(error = %e, task = name, "bridge loop failed");
                    controller.fail(&e, &cancel);
                }
            }
        })
    }

    /// Record a fatal failure and tear the run down in the background.
    fn fail(&self, error: &CoreError, cancel: &CancellationToken) {
        let message = error.to_string();
        self.inner.state.send_if_modified(|state| {
            if matches!(state, BridgeState::Error(_)) {
                return false;
            }
            *state = BridgeState::Error(message);
            true
        });
        cancel.cancel();

        let controller = self.clone();
        tokio::spawn(async move { controller.teardown().await });
    }

    /// Replace the metrics of a running state; ignored once the run ended.
    fn publish_metrics(&self, metrics: BridgeMetrics) {
        self.inner.state.send_if_modified(|state| {
            if !matches!(state, BridgeState::Running(_)) {
                return false;
            }
            *state = BridgeState::Running(metrics);
            true
        });
    }

    /// Cancel the live run, join its loops, release the broker and peers.
    async fn teardown(&self) {
        let mut run = self.inner.run.lock().await;
        let Some(scope) = run.take() else {
            return;
        };

        scope.cancel.cancel();
        for handle in scope.task_handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "bridge task ended abnormally");
            }
        }

        if let Err(e) = self.inner.transport.disconnect().await {
            warn!(error = %e, "MQTT disconnect failed (non-fatal)");
        }
        if let Some(heartbeat) = scope.heartbeat {
            heartbeat.stop(self.inner.config.gcu.broadcast_on_exit);
        }

        self.inner.state.send_if_modified(|state| {
            if matches!(state, BridgeState::Error(_)) {
                return false;
            }
            *state = BridgeState::Idle;
            true
        });
        info!(state = self.state().label(), "bridge stopped");
    }
}

/// Best-effort mirror socket for local forwarding.
async fn forward_socket(target: SocketAddr) -> Option<(Arc<UdpSocket>, SocketAddr)> {
    match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(socket) => Some((Arc::new(socket), target)),
        Err(e) => {
            warn!(error = %e, target = %target, "local forward disabled (non-fatal)");
            None
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Prune stale devices and publish the retained directory snapshot.
async fn registry_publish_task(
    publisher: Publisher,
    registry: Arc<DeviceRegistry>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every.max(MIN_REGISTRY_PERIOD));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let pruned = registry.prune();
        if pruned > 0 {
            debug!(pruned, "stale devices pruned");
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            published = publisher.directory(&registry) => {
                if let Err(e) = published {
                    warn!(error = %e, "directory publish failed (non-fatal)");
                }
            }
        }
    }
}

struct UdpReceiver {
    socket: Arc<UdpSocket>,
    forward: Option<(Arc<UdpSocket>, SocketAddr)>,
    heartbeat: Option<Arc<HeartbeatManager>>,
    queue: Arc<IngestQueue>,
    counters: Arc<BridgeCounters>,
    buffer_len: usize,
    cancel: CancellationToken,
}

/// Receive datagrams, let the heartbeat claim control tokens, queue the rest.
async fn udp_receive_task(rx: UdpReceiver) -> Result<(), CoreError> {
    let mut buf = vec![0u8; rx.buffer_len];

    loop {
        let (len, peer) = tokio::select! {
            biased;
            () = rx.cancel.cancelled() => break,
            received = rx.socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "UDP receive error (non-fatal)");
                    continue;
                }
                Err(e) => return Err(e.into()),
            },
        };
        let Some(datagram) = buf.get(..len) else {
            continue;
        };

        if let Some((socket, target)) = &rx.forward {
            if let Err(e) = socket.try_send_to(datagram, *target) {
                debug!(error = %e, target = %target, "local forward failed (non-fatal)");
            }
        }

        if rx
            .heartbeat
            .as_ref()
            .is_some_and(|heartbeat| heartbeat.handle_datagram(datagram, peer))
        {
            continue;
        }

        let packet = UdpPacket {
            payload: Bytes::copy_from_slice(datagram),
            source: peer,
        };
        if !rx.queue.offer(packet) {
            rx.counters.record_dropped();
        }
    }
    debug!("UDP receive loop stopped");
    Ok(())
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// The single queue consumer: batching, decoding, stats.
struct PublishConsumer {
    controller: BridgeController,
    publisher: Publisher,
    registry: Arc<DeviceRegistry>,
    queue: Arc<IngestQueue>,
    counters: Arc<BridgeCounters>,
    batcher: RawBatcher,
    reporter: StatsReporter,
    publish_raw: bool,
    publish_parsed: bool,
}

impl PublishConsumer {
    async fn run(mut self, poll: Duration, drain_limit: Duration, cancel: CancellationToken) {
        let queue = Arc::clone(&self.queue);

        loop {
            let packet = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                packet = queue.poll(poll) => packet,
            };
            // Publishes can stall on a dead broker; cancellation wins.
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.step(packet) => {}
            }
        }

        if tokio::time::timeout(drain_limit, self.drain()).await.is_err() {
            warn!(
                left = queue.len(),
                "final flush did not finish in {}s, dropping the rest",
                drain_limit.as_secs_f32()
            );
        }
        debug!("publish consumer stopped");
    }

    async fn step(&mut self, packet: Option<UdpPacket>) {
        if let Some(packet) = packet {
            self.handle(packet).await;
        }
        if let Some(batch) = self.batcher.flush_if_timed_out() {
            self.publish_batch(batch).await;
        }
        self.report();
    }

    /// Publish what is still queued or batched after cancellation.
    async fn drain(&mut self) {
        while let Some(packet) = self.queue.try_poll() {
            self.handle(packet).await;
        }
        if let Some(batch) = self.batcher.flush_remaining() {
            self.publish_batch(batch).await;
        }
    }

    async fn handle(&mut self, packet: UdpPacket) {
        self.counters.record_packet_in();

        if self.publish_raw {
            if let Some(batch) = self.batcher.enqueue(packet.payload.clone()) {
                self.publish_batch(batch).await;
            }
        }

        let ip = packet.source.ip();
        if self.publish_parsed {
            let Some(frame) = codec::parse(&packet.payload) else {
                self.counters.record_parse_error();
                debug!(source = %packet.source, len = packet.payload.len(), "undecodable frame");
                return;
            };
            self.registry.record(&frame.dn, ip);
            match self.publisher.parsed(&frame).await {
                Ok(()) => self.counters.record_parsed_published(),
                Err(e) => warn!(error = %e, dn = %frame.dn, "parsed publish failed (non-fatal)"),
            }
        } else if let Some(meta) = codec::peek_metadata(&packet.payload) {
            self.registry.record(&meta.dn, ip);
        }
    }

    async fn publish_batch(&self, batch: RawBatch) {
        match self.publisher.raw(batch.payload).await {
            Ok(()) => self.counters.add_raw_published(batch.items),
            Err(e) => warn!(error = %e, items = batch.items, "raw publish failed (non-fatal)"),
        }
    }

    fn report(&mut self) {
        let devices = self.registry.active_count();
        if let Some(metrics) = self
            .reporter
            .maybe_emit(&self.counters, devices, self.queue.len())
        {
            self.controller.publish_metrics(metrics);
        }
    }
}
