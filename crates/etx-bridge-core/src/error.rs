// ── Core error types ──
//
// Errors surfaced by etx-bridge-core. Malformed frames and per-command
// failures never become a `CoreError` that reaches the controller; they
// are counted or answered with an error result where they happen.
// Only infrastructure failures abort a run.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Infrastructure errors (fatal for a run) ──────────────────────
    #[error("Cannot bind UDP socket on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Cannot connect to MQTT broker at {broker}: {reason}")]
    MqttConnect { broker: String, reason: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    // ── Device errors (reported as command results) ──────────────────
    #[error("Device at {addr} unreachable: {reason}")]
    DeviceUnreachable { addr: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether this error makes the current run unable to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::MqttConnect { .. } | Self::Mqtt { .. } | Self::Internal(_)
        )
    }
}
