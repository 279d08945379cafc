// ── Device command types ──
//
// Inbound MQTT command documents are parsed into a `CommandRequest`;
// every request, valid or not, ends in exactly one `CommandResult`.

mod dispatch;

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::codec::format_dn;
use crate::registry::normalize_dn;

pub use dispatch::CommandDispatcher;

/// Keys inside `payload` that mark a free-form control command.
const CONTROL_KEYS: [&str; 5] = ["standby", "filter", "calibration", "spiffs", "log"];

// ── Request ──────────────────────────────────────────────────────

/// What the bridge should do with a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    /// Pin configuration line `{"analog","select","model"}`.
    Configure {
        analog: Value,
        select: Value,
        model: Value,
    },
    /// Forward the `payload` object verbatim (standby, filter,
    /// calibration, spiffs, log, or explicit raw/custom/control).
    Control(Map<String, Value>),
    LicenseApply { token: String },
    LicenseQuery,
    /// UDP broadcast discovery; needs no target device.
    Discover(DiscoverOptions),
}

impl CommandAction {
    /// JSON object written to the device, if this action talks TCP.
    pub fn device_line(&self) -> Option<Value> {
        match self {
            Self::Configure {
                analog,
                select,
                model,
            } => Some(json!({ "analog": analog, "select": select, "model": model })),
            Self::Control(payload) => Some(Value::Object(payload.clone())),
            Self::LicenseApply { token } => Some(json!({ "license": token })),
            Self::LicenseQuery => Some(json!({ "license": "?" })),
            Self::Discover(_) => None,
        }
    }
}

/// Overrides carried by a discover command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverOptions {
    pub attempts: Option<u32>,
    pub gap: Option<Duration>,
    pub timeout: Option<Duration>,
    pub broadcast: Option<Vec<String>>,
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command_id: String,
    /// Normalized target id; `None` only for discovery.
    pub dn: Option<String>,
    /// Explicit IP from `ip`, `target_ip` or `payload.ip`.
    pub ip: Option<String>,
    /// Explicit TCP port from `payload.port` or `port`.
    pub port: Option<u16>,
    pub requested_by: Option<String>,
    pub action: CommandAction,
}

/// A command that could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub command_id: String,
    pub dn: String,
    pub requested_by: Option<String>,
    pub message: String,
}

impl CommandRequest {
    /// Parse an MQTT command body.
    pub fn parse(body: &[u8]) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_slice(body).map_err(|e| Rejection {
            command_id: String::new(),
            dn: String::new(),
            requested_by: None,
            message: format!("invalid-json: {e}"),
        })?;
        let Value::Object(cmd) = value else {
            return Err(Rejection {
                command_id: String::new(),
                dn: String::new(),
                requested_by: None,
                message: "payload must be JSON object".into(),
            });
        };
        Self::from_object(&cmd)
    }

    fn from_object(cmd: &Map<String, Value>) -> Result<Self, Rejection> {
        let empty = Map::new();
        let payload = cmd.get("payload").and_then(Value::as_object).unwrap_or(&empty);

        let command_id = text(cmd.get("command_id"))
            .unwrap_or_else(|| format!("cmd-{}", chrono::Utc::now().timestamp_millis()));
        let kind = text(cmd.get("type"))
            .or_else(|| text(payload.get("type")))
            .unwrap_or_default()
            .to_ascii_lowercase();
        let dn = cmd
            .get("target_dn")
            .filter(|v| !is_blank(v))
            .or_else(|| cmd.get("dn"))
            .and_then(dn_from_value);
        let requested_by = text(cmd.get("requested_by")).or_else(|| text(payload.get("requested_by")));

        let reject = |message: String| Rejection {
            command_id: command_id.clone(),
            dn: dn.clone().unwrap_or_default(),
            requested_by: requested_by.clone(),
            message,
        };

        let action = match kind.as_str() {
            "discover" | "discover_only" | "discover_devices" => {
                CommandAction::Discover(discover_options(cmd, payload))
            }
            "license" | "license_apply" => {
                let token = text(payload.get("license"))
                    .or_else(|| text(payload.get("license_token")))
                    .or_else(|| text(cmd.get("license")))
                    .ok_or_else(|| reject("license token is required".into()))?;
                CommandAction::LicenseApply { token }
            }
            "license_query" | "license_query_only" => CommandAction::LicenseQuery,
            k if matches!(k, "raw" | "custom" | "control")
                || CONTROL_KEYS.iter().any(|key| payload.contains_key(*key)) =>
            {
                CommandAction::Control(payload.clone())
            }
            _ => {
                let pin = |name: &str| {
                    cmd.get(name)
                        .or_else(|| payload.get(name))
                        .cloned()
                        .unwrap_or(Value::Null)
                };
                let (analog, select, model) = (pin("analog"), pin("select"), pin("model"));
                if analog.is_null() && select.is_null() && model.is_null() {
                    return Err(reject(format!(
                        "Unknown command type '{kind}' and no config pins provided"
                    )));
                }
                CommandAction::Configure {
                    analog,
                    select,
                    model,
                }
            }
        };

        if dn.is_none() && !matches!(action, CommandAction::Discover(_)) {
            return Err(reject("target_dn required".into()));
        }

        Ok(Self {
            command_id,
            dn,
            ip: text(cmd.get("ip"))
                .or_else(|| text(cmd.get("target_ip")))
                .or_else(|| text(payload.get("ip"))),
            port: port(payload.get("port")).or_else(|| port(cmd.get("port"))),
            requested_by,
            action,
        })
    }
}

// ── Result ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Ok,
    Error,
}

/// Document published to `<resultTopic>/<agentId>/<commandId>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub agent_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub status: CommandStatus,
    pub command_id: String,
    pub dn: String,
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_topic: Option<String>,
}

impl CommandResult {
    pub fn ok(agent_id: &str, command_id: &str, dn: &str, ip: Option<String>, reply: Value) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            status: CommandStatus::Ok,
            command_id: command_id.to_owned(),
            dn: dn.to_owned(),
            ip,
            error: None,
            reply: Some(reply),
            payload: None,
            requested_by: None,
            source_topic: None,
        }
    }

    pub fn error(
        agent_id: &str,
        command_id: &str,
        dn: &str,
        ip: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            status: CommandStatus::Error,
            command_id: command_id.to_owned(),
            dn: dn.to_owned(),
            ip,
            error: Some(error.into()),
            reply: None,
            payload: None,
            requested_by: None,
            source_topic: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}

// ── Field helpers ────────────────────────────────────────────────

/// Non-blank string or number rendered as text.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Device id from a string (normalized when it is hex) or a number.
fn dn_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(format_dn),
        Value::String(s) if !s.trim().is_empty() => {
            Some(normalize_dn(s).unwrap_or_else(|| s.trim().to_ascii_uppercase()))
        }
        _ => None,
    }
}

fn port(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p| *p > 0)
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn count(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|c| u32::try_from(c).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn discover_options(cmd: &Map<String, Value>, payload: &Map<String, Value>) -> DiscoverOptions {
    let field = |name: &str| number(payload.get(name)).or_else(|| number(cmd.get(name)));
    let seconds = |name: &str| {
        field(name)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    };
    let broadcast = payload
        .get("broadcast")
        .or_else(|| payload.get("broadcast_addrs"))
        .or_else(|| cmd.get("broadcast"))
        .and_then(broadcast_list);

    DiscoverOptions {
        attempts: count(payload.get("attempts"))
            .or_else(|| count(cmd.get("attempts")))
            .filter(|a| *a >= 1),
        gap: seconds("gap"),
        timeout: seconds("timeout"),
        broadcast,
    }
}

/// A list of addresses, either as a JSON array or a comma-separated string.
fn broadcast_list(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::String(s) => s.split(',').map(str::trim).map(str::to_owned).collect(),
        Value::Array(items) => items.iter().filter_map(|v| text(Some(v))).collect(),
        _ => return None,
    };
    let items: Vec<String> = items.into_iter().filter(|s| !s.is_empty()).collect();
    (!items.is_empty()).then_some(items)
}
