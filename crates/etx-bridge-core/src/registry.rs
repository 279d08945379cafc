// ── Device registry ──
//
// Concurrent map of device id -> last-seen source IP. Staleness is judged
// at read time against the TTL; nothing is returned past its TTL.
// Cardinality is bounded by the set of distinct device ids, which is small
// in practice; `prune()` reclaims stale entries and runs before every
// directory publish.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct DeviceEntry {
    ip: IpAddr,
    seen: Instant,
    seen_at: DateTime<Utc>,
}

/// One live device in a [`RegistrySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSighting {
    pub dn: String,
    pub ip: IpAddr,
    /// ISO-8601 UTC with millisecond precision.
    pub last_seen: String,
}

/// Directory document published (retained) to the agent topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub agent_id: String,
    pub device_count: usize,
    pub devices: Vec<DeviceSighting>,
    /// Epoch milliseconds at snapshot time.
    pub timestamp: i64,
}

/// TTL map of device id to last-seen IP.
#[derive(Debug)]
pub struct DeviceRegistry {
    entries: DashMap<String, DeviceEntry>,
    ttl: Duration,
}

impl DeviceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Upsert `dn` with `last_seen = now`.
    ///
    /// Returns `false` (and records nothing) when `dn` is not a usable
    /// device id. The latest call always wins.
    pub fn record(&self, dn: &str, ip: IpAddr) -> bool {
        let Some(key) = normalize_dn(dn) else {
            return false;
        };
        self.entries.insert(
            key,
            DeviceEntry {
                ip,
                seen: Instant::now(),
                seen_at: Utc::now(),
            },
        );
        true
    }

    /// The last recorded IP for `dn`, if seen within the TTL.
    pub fn resolve(&self, dn: &str) -> Option<IpAddr> {
        let key = normalize_dn(dn)?;
        let now = Instant::now();
        self.entries
            .get(&key)
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.ip)
    }

    /// Materialize the live devices, sorted by id.
    pub fn snapshot(&self, agent_id: &str) -> RegistrySnapshot {
        let now = Instant::now();
        let mut devices: Vec<DeviceSighting> = self
            .entries
            .iter()
            .filter(|entry| self.is_live(entry.value(), now))
            .map(|entry| DeviceSighting {
                dn: entry.key().clone(),
                ip: entry.ip,
                last_seen: entry.seen_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();
        devices.sort_by(|a, b| a.dn.cmp(&b.dn));

        RegistrySnapshot {
            agent_id: agent_id.to_owned(),
            device_count: devices.len(),
            devices,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Number of devices seen within the TTL.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| self.is_live(entry.value(), now))
            .count()
    }

    /// Drop entries past their TTL. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_live(entry, now));
        before.saturating_sub(self.entries.len())
    }

    /// Tracked entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, entry: &DeviceEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.seen) <= self.ttl
    }
}

/// Canonical form of a device id: separators stripped, uppercase hex,
/// the last 12 digits, left-padded to 12.
///
/// Returns `None` for ids that are not hex or shorter than 8 digits.
pub fn normalize_dn(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.len() < 8 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let tail = &cleaned[cleaned.len().saturating_sub(12)..];
    Some(format!("{tail:0>12}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_respects_ttl() {
        let registry = DeviceRegistry::new(Duration::from_secs(10));
        assert!(registry.record("AABBCCDDEEFF", ip(7)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(registry.resolve("AABBCCDDEEFF"), Some(ip(7)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.resolve("AABBCCDDEEFF"), None);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_record_wins_and_refreshes_ttl() {
        let registry = DeviceRegistry::new(Duration::from_secs(10));
        registry.record("AABBCCDDEEFF", ip(1));
        tokio::time::advance(Duration::from_secs(8)).await;
        registry.record("AABBCCDDEEFF", ip(2));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(registry.resolve("AABBCCDDEEFF"), Some(ip(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_lists_live_devices_sorted() {
        let registry = DeviceRegistry::new(Duration::from_secs(10));
        registry.record("000000000002", ip(2));
        tokio::time::advance(Duration::from_secs(20)).await;
        registry.record("BBBBBBBBBBBB", ip(3));
        registry.record("AAAAAAAAAAAA", ip(4));

        let snap = registry.snapshot("agent-abc123");
        assert_eq!(snap.agent_id, "agent-abc123");
        assert_eq!(snap.device_count, 2);
        let ids: Vec<&str> = snap.devices.iter().map(|d| d.dn.as_str()).collect();
        assert_eq!(ids, vec!["AAAAAAAAAAAA", "BBBBBBBBBBBB"]);
        assert!(snap.devices[0].last_seen.ends_with('Z'));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["devices"][0]["ip"], "192.168.1.4");
        assert!(json["timestamp"].is_i64());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_only_stale_entries() {
        let registry = DeviceRegistry::new(Duration::from_secs(5));
        registry.record("111111111111", ip(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.record("222222222222", ip(2));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("222222222222"), Some(ip(2)));
    }

    #[test]
    fn rejects_unusable_ids() {
        let registry = DeviceRegistry::new(Duration::from_secs(5));
        assert!(!registry.record("", ip(1)));
        assert!(!registry.record("ABC", ip(1)));
        assert!(!registry.record("not-a-hex-id", ip(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn normalizes_ids() {
        assert_eq!(normalize_dn("aa:bb:cc:dd:ee:ff").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_dn("aa-bb-cc-dd").unwrap(), "0000AABBCCDD");
        assert_eq!(normalize_dn("0011AABBCCDDEEFF").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_dn("zz112233"), None);
    }

    #[test]
    fn lookups_use_normalized_id() {
        let registry = DeviceRegistry::new(Duration::from_secs(60));
        registry.record("aabbccddeeff", ip(9));
        assert_eq!(registry.resolve("AA:BB:CC:DD:EE:FF"), Some(ip(9)));
    }
}
