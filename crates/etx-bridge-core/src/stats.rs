// ── Metrics ──
//
// Loops bump `BridgeCounters` through dedicated calls; `StatsReporter`
// turns them into periodic `BridgeMetrics` snapshots for the state stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

/// Monotonic counters shared by the bridge loops.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    packets_in: AtomicU64,
    parsed_published: AtomicU64,
    raw_published: AtomicU64,
    dropped: AtomicU64,
    parse_errors: AtomicU64,
}

impl BridgeCounters {
    pub fn record_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parsed_published(&self) {
        self.parsed_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Count raw datagrams (not messages) that reached the broker.
    pub fn add_raw_published(&self, items: usize) {
        self.raw_published
            .fetch_add(u64::try_from(items).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters into a metrics value.
    pub fn read(&self, device_count: usize, queue_depth: usize) -> BridgeMetrics {
        BridgeMetrics {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            parsed_published: self.parsed_published.load(Ordering::Relaxed),
            raw_published: self.raw_published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            device_count,
            queue_depth,
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time view of the bridge counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeMetrics {
    pub packets_in: u64,
    pub parsed_published: u64,
    pub raw_published: u64,
    pub dropped: u64,
    pub parse_errors: u64,
    pub device_count: usize,
    pub queue_depth: usize,
    pub updated_at: DateTime<Utc>,
}

/// Emits a metrics snapshot at most once per interval.
#[derive(Debug)]
pub struct StatsReporter {
    interval: Duration,
    last_emit: Instant,
    previous: BridgeMetrics,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Instant::now(),
            previous: BridgeMetrics::default(),
        }
    }

    /// Returns a fresh snapshot when the interval has elapsed since the
    /// last one, and logs per-second rates for it.
    pub fn maybe_emit(
        &mut self,
        counters: &BridgeCounters,
        device_count: usize,
        queue_depth: usize,
    ) -> Option<BridgeMetrics> {
        let elapsed = self.last_emit.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let metrics = counters.read(device_count, queue_depth);
        let secs = elapsed.as_secs_f64().max(1e-6);
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let rate = |now: u64, before: u64| now.saturating_sub(before) as f64 / secs;
        let in_rate = rate(metrics.packets_in, self.previous.packets_in);
        let raw_rate = rate(metrics.raw_published, self.previous.raw_published);
        let parsed_rate = rate(metrics.parsed_published, self.previous.parsed_published);

        info!(
            packets_in = metrics.packets_in,
            in_rate,
            raw_published = metrics.raw_published,
            raw_rate,
            parsed_published = metrics.parsed_published,
            parsed_rate,
            dropped = metrics.dropped,
            parse_errors = metrics.parse_errors,
            queue_depth,
            devices = device_count,
            "bridge stats"
        );

        self.last_emit = Instant::now();
        self.previous = metrics.clone();
        Some(metrics)
    }
}
