// ── GCU heartbeat / subscription manager ──
//
// Per-peer sessions keyed by socket address. Data from an unknown peer
// bootstraps a session with an immediate SUBSCRIBE; a periodic tick
// re-subscribes live peers and drops peers silent for longer than the
// failover window. Control tokens share the sensor UDP socket; a
// datagram is a control token only when it is short printable ASCII that
// matches a configured token exactly, ignoring case.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GcuConfig;

const MAX_TOKEN_LEN: usize = 64;
const MIN_TICK: Duration = Duration::from_millis(500);

// ── Token sink ───────────────────────────────────────────────────

/// Outbound path for control tokens. Sends are best-effort.
pub trait TokenSink: Send + Sync {
    fn send_token(&self, token: &[u8], peer: SocketAddr) -> std::io::Result<usize>;
}

impl TokenSink for tokio::net::UdpSocket {
    fn send_token(&self, token: &[u8], peer: SocketAddr) -> std::io::Result<usize> {
        self.try_send_to(token, peer)
    }
}

// ── Control tokens ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Subscribe,
    Ack,
    Broadcast,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    last_seen: Instant,
    last_subscribe: Option<Instant>,
}

// ── HeartbeatManager ─────────────────────────────────────────────

pub struct HeartbeatManager {
    sink: Arc<dyn TokenSink>,
    sessions: DashMap<SocketAddr, Session>,
    subscribe: String,
    ack: String,
    broadcast: String,
    interval: Duration,
    failover: Duration,
}

impl HeartbeatManager {
    pub fn new(config: &GcuConfig, sink: Arc<dyn TokenSink>) -> Self {
        Self {
            sink,
            sessions: DashMap::new(),
            subscribe: config.subscribe_token.trim().to_owned(),
            ack: config.ack_token.trim().to_owned(),
            broadcast: config.broadcast_token.trim().to_owned(),
            interval: config.heartbeat_interval,
            failover: config.failover,
        }
    }

    /// Feed one inbound datagram. Returns `true` when it was a control
    /// token and must not reach the sensor path.
    pub fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) -> bool {
        match self.decode_control(payload) {
            // An echoed SUBSCRIBE is control traffic too; it only proves liveness.
            Some(ControlToken::Ack | ControlToken::Subscribe) => {
                self.touch(peer, false);
                true
            }
            Some(ControlToken::Broadcast) => {
                if self.sessions.remove(&peer).is_some() {
                    info!(peer = %peer, "GCU peer released its session");
                }
                true
            }
            None => {
                self.touch(peer, true);
                false
            }
        }
    }

    /// Classify `payload` as one of the configured tokens.
    pub fn decode_control(&self, payload: &[u8]) -> Option<ControlToken> {
        if payload.is_empty()
            || payload.len() > MAX_TOKEN_LEN
            || !payload.iter().all(|b| (0x20..=0x7E).contains(b))
        {
            return None;
        }
        let text = std::str::from_utf8(payload).ok()?.trim();
        if text.eq_ignore_ascii_case(&self.ack) {
            Some(ControlToken::Ack)
        } else if text.eq_ignore_ascii_case(&self.broadcast) {
            Some(ControlToken::Broadcast)
        } else if text.eq_ignore_ascii_case(&self.subscribe) {
            Some(ControlToken::Subscribe)
        } else {
            None
        }
    }

    /// One heartbeat pass: expire silent peers, re-subscribe due ones.
    pub fn tick(&self) {
        let now = Instant::now();
        self.sessions.retain(|peer, session| {
            if now.saturating_duration_since(session.last_seen) > self.failover {
                info!(peer = %peer, "GCU peer silent past failover, dropping session");
                return false;
            }
            if self.subscribe_due(session, now) {
                self.send(self.subscribe.as_bytes(), *peer);
                session.last_subscribe = Some(now);
            }
            true
        });
    }

    /// Tick period: half the heartbeat interval, floored at 500 ms.
    pub fn tick_interval(&self) -> Duration {
        (self.interval / 2).max(MIN_TICK)
    }

    /// Run the periodic tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(),
            }
        }
        debug!("GCU heartbeat loop stopped");
    }

    /// Release every session, optionally telling each peer first.
    pub fn stop(&self, broadcast: bool) {
        if broadcast {
            for entry in &self.sessions {
                self.send(self.broadcast.as_bytes(), *entry.key());
            }
        }
        self.sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    fn touch(&self, peer: SocketAddr, bootstrap: bool) {
        let now = Instant::now();
        let mut session = self.sessions.entry(peer).or_insert(Session {
            last_seen: now,
            last_subscribe: None,
        });
        session.last_seen = now;

        let due = if bootstrap {
            session.last_subscribe.is_none() || self.subscribe_due(&session, now)
        } else {
            session.last_subscribe.is_some() && self.subscribe_due(&session, now)
        };
        if due {
            self.send(self.subscribe.as_bytes(), peer);
            session.last_subscribe = Some(now);
        }
    }

    fn subscribe_due(&self, session: &Session, now: Instant) -> bool {
        session
            .last_subscribe
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.interval)
    }

    fn send(&self, token: &[u8], peer: SocketAddr) {
        if let Err(e) = self.sink.send_token(token, peer) {
            debug!(error = %e, peer = %peer, "GCU token send failed (non-fatal)");
        }
    }
}
