//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use etx_bridge_config::ConfigError;
use etx_bridge_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    #[allow(dead_code)]
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 7;
    pub const BIND: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Infrastructure ───────────────────────────────────────────────

    #[error("Could not connect to MQTT broker at {broker}: {reason}")]
    #[diagnostic(
        code(etx_bridge::connection_failed),
        help(
            "Check that the broker is running and reachable.\n\
             Override it with --broker/--port or ETX_BRIDGE_MQTT__HOST."
        )
    )]
    ConnectionFailed { broker: String, reason: String },

    #[error("Could not bind UDP socket on {addr}: {reason}")]
    #[diagnostic(
        code(etx_bridge::bind_failed),
        help("Another process may own the port. Pick a different one with --udp-port.")
    )]
    BindFailed { addr: String, reason: String },

    #[error("Bridge stopped: {message}")]
    #[diagnostic(code(etx_bridge::runtime))]
    Runtime { message: String },

    // ── Input ────────────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(etx_bridge::validation))]
    Validation { field: String, reason: String },

    #[error("Not a sensor frame: {reason}")]
    #[diagnostic(
        code(etx_bridge::decode),
        help("Frames start with 5A5A, end with A5A5 and carry 54 + 4*sn bytes.")
    )]
    Decode { reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file not found: {path}")]
    #[diagnostic(
        code(etx_bridge::no_config),
        help("Create one with: etx-bridge config init")
    )]
    NoConfig { path: String },

    #[error("Configuration file already exists: {path}")]
    #[diagnostic(
        code(etx_bridge::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(etx_bridge::config))]
    Config(Box<figment::Error>),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not render config: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::BindFailed { .. } => exit_code::BIND,
            Self::Validation { .. } | Self::Decode { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Bind { addr, reason } => CliError::BindFailed { addr, reason },
            CoreError::MqttConnect { broker, reason } => {
                CliError::ConnectionFailed { broker, reason }
            }
            CoreError::Io(e) => CliError::Io(e),
            other => CliError::Runtime {
                message: other.to_string(),
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NotFound { path } => CliError::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Serialization(e) => CliError::Toml(e),
            ConfigError::Figment(e) => CliError::Config(e),
            ConfigError::Io(e) => CliError::Io(e),
        }
    }
}
