// ── Device TCP link ──
//
// One short-lived connection per command: connect, write one JSON line,
// read one reply line, close. Connect and read are each bounded by the
// configured timeout.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::CoreError;

/// Send `line` (a JSON object) to `addr` and return the device reply.
///
/// A blank reply, EOF or read timeout yields `{"status":"no-reply"}`; a
/// non-JSON reply is wrapped as `{"raw": <line>}`.
pub async fn exchange(addr: SocketAddr, line: &Value, timeout: Duration) -> Result<Value, CoreError> {
    let fail = |reason: String| CoreError::DeviceUnreachable {
        addr: addr.to_string(),
        reason,
    };

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| fail(format!("connect timed out after {}ms", timeout.as_millis())))?
        .map_err(|e| fail(e.to_string()))?;

    let mut wire = serde_json::to_vec(line).map_err(|e| CoreError::Internal(e.to_string()))?;
    wire.push(b'\n');
    stream
        .write_all(&wire)
        .await
        .map_err(|e| fail(e.to_string()))?;
    debug!(addr = %addr, bytes = wire.len(), "device command sent");

    let mut reader = BufReader::new(stream);
    let mut reply = Vec::new();
    match tokio::time::timeout(timeout, reader.read_until(b'\n', &mut reply)).await {
        Ok(Ok(_)) | Err(_) => {}
        Ok(Err(e)) => return Err(fail(e.to_string())),
    }

    Ok(interpret_reply(&String::from_utf8_lossy(&reply)))
}

/// Classify one reply line.
pub fn interpret_reply(line: &str) -> Value {
    let line = line.trim();
    if line.is_empty() {
        return json!({ "status": "no-reply" });
    }
    serde_json::from_str(line).unwrap_or_else(|_| json!({ "raw": line }))
}
