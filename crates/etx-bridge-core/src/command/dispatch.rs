// ── Command dispatcher ──
//
// Turns each inbound command message into at most one device exchange
// and exactly one published result.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandAction, CommandRequest, CommandResult, DiscoverOptions, Rejection};
use crate::config::{BridgeConfig, DeviceConfig, DiscoveryConfig};
use crate::device;
use crate::discovery::{self, DiscoveryPlan};
use crate::publisher::Publisher;
use crate::registry::{DeviceRegistry, normalize_dn};
use crate::transport::InboundMessage;

/// Device id reported on discovery results.
const BROADCAST_DN: &str = "BROADCAST";

pub struct CommandDispatcher {
    publisher: Publisher,
    registry: Arc<DeviceRegistry>,
    device: DeviceConfig,
    discovery: DiscoveryConfig,
}

impl CommandDispatcher {
    pub fn new(config: &BridgeConfig, publisher: Publisher, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            publisher,
            registry,
            device: config.device.clone(),
            discovery: config.discovery.clone(),
        }
    }

    /// Process one command message and publish its result.
    ///
    /// Never fails: parse errors, unresolved targets and device failures
    /// all end up as an `error` result.
    pub async fn handle(&self, message: &InboundMessage) -> CommandResult {
        let mut result = match CommandRequest::parse(&message.payload) {
            Ok(request) => self.execute(&request).await,
            Err(rejection) => self.rejected(rejection),
        };
        result.source_topic = Some(message.topic.clone());

        if let Err(e) = self.publisher.result(&result).await {
            warn!(error = %e, command_id = %result.command_id, "result publish failed");
        }
        debug!(
            command_id = %result.command_id,
            dn = %result.dn,
            ok = result.is_ok(),
            "command handled"
        );
        result
    }

    /// Consume commands until cancelled. Each command runs on its own
    /// task so a slow device never holds up the next message.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        dispatcher.handle(&message).await;
                    });
                }
            }
        }
        debug!("command loop stopped");
    }

    fn rejected(&self, rejection: Rejection) -> CommandResult {
        warn!(command_id = %rejection.command_id, reason = %rejection.message, "command rejected");
        let mut result = CommandResult::error(
            self.publisher.agent_id(),
            &rejection.command_id,
            &rejection.dn,
            None,
            rejection.message,
        );
        result.requested_by = rejection.requested_by;
        result
    }

    async fn execute(&self, request: &CommandRequest) -> CommandResult {
        let mut result = match &request.action {
            CommandAction::Discover(options) => self.discover(request, options).await,
            action => self.device_command(request, action).await,
        };
        result.requested_by.clone_from(&request.requested_by);
        result
    }

    async fn device_command(&self, request: &CommandRequest, action: &CommandAction) -> CommandResult {
        let agent_id = self.publisher.agent_id();
        let dn = request.dn.as_deref().unwrap_or_default();
        let Some(line) = action.device_line() else {
            return CommandResult::error(agent_id, &request.command_id, dn, None, "no device payload");
        };

        let ip = match self.target_ip(request, dn) {
            Ok(ip) => ip,
            Err(message) => {
                let mut result =
                    CommandResult::error(agent_id, &request.command_id, dn, request.ip.clone(), message);
                result.payload = Some(line);
                return result;
            }
        };
        let port = request.port.unwrap_or(self.device.tcp_port);
        let addr = SocketAddr::new(ip, port);

        info!(command_id = %request.command_id, dn, addr = %addr, "sending device command");
        let mut result = match device::exchange(addr, &line, self.device.timeout).await {
            Ok(reply) => {
                CommandResult::ok(agent_id, &request.command_id, dn, Some(ip.to_string()), reply)
            }
            Err(e) => {
                warn!(error = %e, command_id = %request.command_id, "device command failed");
                CommandResult::error(agent_id, &request.command_id, dn, Some(ip.to_string()), e.to_string())
            }
        };
        result.payload = Some(line);
        result
    }

    /// Explicit IP first, then the registry. Never touches the network.
    fn target_ip(&self, request: &CommandRequest, dn: &str) -> Result<IpAddr, String> {
        if let Some(raw) = &request.ip {
            return raw
                .parse()
                .map_err(|_| format!("invalid IP address '{raw}'"));
        }
        self.registry
            .resolve(dn)
            .ok_or_else(|| "no IP associated with device id".to_owned())
    }

    async fn discover(&self, request: &CommandRequest, options: &DiscoverOptions) -> CommandResult {
        let agent_id = self.publisher.agent_id();
        let mut plan = DiscoveryPlan::from_config(&self.discovery);
        if let Some(attempts) = options.attempts {
            plan.attempts = attempts;
        }
        if let Some(gap) = options.gap {
            plan.gap = gap;
        }
        if let Some(timeout) = options.timeout {
            plan.timeout = timeout;
        }
        if let Some(targets) = &options.broadcast {
            plan.targets.clone_from(targets);
        }

        let items = match discovery::discover(&plan).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "discovery failed");
                return CommandResult::error(agent_id, &request.command_id, BROADCAST_DN, None, e.to_string());
            }
        };

        let recorded = items
            .iter()
            .filter(|reply| self.record_reply(reply))
            .count();
        if recorded > 0 {
            if let Err(e) = self.publisher.directory(&self.registry).await {
                warn!(error = %e, "directory publish after discovery failed (non-fatal)");
            }
        }
        info!(found = items.len(), recorded, "discovery complete");

        CommandResult::ok(
            agent_id,
            &request.command_id,
            BROADCAST_DN,
            None,
            json!({ "count": items.len(), "items": items }),
        )
    }

    fn record_reply(&self, reply: &Value) -> bool {
        let Some(dn) = discovery::reply_device_id(reply).and_then(normalize_dn) else {
            return false;
        };
        discovery::reply_ip(reply).is_some_and(|ip| self.registry.record(&dn, ip))
    }
}
