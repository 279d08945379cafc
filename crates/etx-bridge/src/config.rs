//! CLI configuration: a thin wrapper around `etx_bridge_config`.
//!
//! Re-exports the shared types and layers `GlobalOpts` flag overrides
//! (--broker, --port, --udp-port, --agent-id) on top of file and env.

use std::path::PathBuf;

use etx_bridge_core::BridgeConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

// ── Re-exports from shared crate ────────────────────────────────────

pub use etx_bridge_config::{Config, config_path, load_config, save_config};

// ── CLI-specific helpers ────────────────────────────────────────────

/// The file `--config` names, or the platform default.
pub fn resolved_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config_path)
}

/// Load file + env, then apply flag overrides.
pub fn load_effective(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut cfg = load_config(global.config.as_deref())?;
    apply_overrides(&mut cfg, global);
    Ok(cfg)
}

/// Flags take priority over env and file values.
pub fn apply_overrides(cfg: &mut Config, global: &GlobalOpts) {
    if let Some(ref broker) = global.broker {
        cfg.mqtt.host.clone_from(broker);
    }
    if let Some(port) = global.port {
        cfg.mqtt.port = port;
    }
    if let Some(port) = global.udp_port {
        cfg.udp.port = port;
    }
    if let Some(ref agent_id) = global.agent_id {
        cfg.agent_id = Some(agent_id.clone());
    }
}

/// Validate the effective config and translate it for the core crate.
pub fn build_bridge_config(global: &GlobalOpts) -> Result<BridgeConfig, CliError> {
    Ok(load_effective(global)?.to_bridge_config()?)
}
