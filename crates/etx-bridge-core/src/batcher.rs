// ── Raw batch aggregation ──
//
// Collects raw datagrams and emits them as one joined payload when the
// item threshold is hit or the oldest item has waited long enough. The
// batcher is owned by the publish consumer; it never publishes itself.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::config::{BatchConfig, Separator};

/// A flushed batch ready for the raw topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    pub payload: Bytes,
    /// Number of datagrams joined into `payload`.
    pub items: usize,
}

#[derive(Debug)]
pub struct RawBatcher {
    items: Vec<Bytes>,
    started: Option<Instant>,
    max_items: usize,
    max_wait: Duration,
    separator: Separator,
}

impl RawBatcher {
    pub fn new(config: &BatchConfig) -> Self {
        let max_items = config.max_items.max(1);
        Self {
            items: Vec::with_capacity(max_items),
            started: None,
            max_items,
            max_wait: config.max_wait,
            separator: config.separator,
        }
    }

    /// Append a payload; returns the batch if this filled it.
    pub fn enqueue(&mut self, payload: Bytes) -> Option<RawBatch> {
        if self.items.is_empty() {
            self.started = Some(Instant::now());
        }
        self.items.push(payload);
        if self.items.len() >= self.max_items {
            return self.take();
        }
        None
    }

    /// Flush a partial batch whose first item is at least `max_wait` old.
    pub fn flush_if_timed_out(&mut self) -> Option<RawBatch> {
        let started = self.started?;
        if started.elapsed() >= self.max_wait {
            return self.take();
        }
        None
    }

    /// Unconditional flush, used on shutdown.
    pub fn flush_remaining(&mut self) -> Option<RawBatch> {
        self.take()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn take(&mut self) -> Option<RawBatch> {
        self.started = None;
        if self.items.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.items);
        let count = items.len();

        if let [single] = items.as_slice() {
            return Some(RawBatch {
                payload: single.clone(),
                items: 1,
            });
        }

        let sep = self.separator.as_bytes();
        let total = items.iter().map(Bytes::len).sum::<usize>() + sep.len() * (count - 1);
        let mut joined = BytesMut::with_capacity(total);
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                joined.extend_from_slice(sep);
            }
            joined.extend_from_slice(item);
        }
        Some(RawBatch {
            payload: joined.freeze(),
            items: count,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn batcher(max_items: usize, max_wait_ms: u64, separator: Separator) -> RawBatcher {
        RawBatcher::new(&BatchConfig {
            max_items,
            max_wait: Duration::from_millis(max_wait_ms),
            separator,
        })
    }

    #[test]
    fn flushes_exactly_once_at_item_threshold() {
        let mut b = batcher(3, 1_000, Separator::Newline);
        assert!(b.enqueue(Bytes::from_static(b"a")).is_none());
        assert!(b.enqueue(Bytes::from_static(b"b")).is_none());
        let batch = b.enqueue(Bytes::from_static(b"c")).unwrap();

        assert_eq!(batch.items, 3);
        assert_eq!(&batch.payload[..], b"a\nb\nc");
        assert!(b.is_empty());
        assert!(b.flush_remaining().is_none());
    }

    #[test]
    fn no_separator_concatenates() {
        let mut b = batcher(2, 1_000, Separator::None);
        b.enqueue(Bytes::from_static(b"\x5a\x5a"));
        let batch = b.enqueue(Bytes::from_static(b"\xa5\xa5")).unwrap();
        assert_eq!(&batch.payload[..], b"\x5a\x5a\xa5\xa5");
    }

    #[test]
    fn single_payload_is_verbatim() {
        let mut b = batcher(10, 1_000, Separator::Newline);
        b.enqueue(Bytes::from_static(b"only"));
        let batch = b.flush_remaining().unwrap();
        assert_eq!(&batch.payload[..], b"only");
        assert_eq!(batch.items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_max_wait() {
        let mut b = batcher(50, 40, Separator::None);
        b.enqueue(Bytes::from_static(b"x"));
        tokio::time::advance(Duration::from_millis(20)).await;
        b.enqueue(Bytes::from_static(b"y"));
        assert!(b.flush_if_timed_out().is_none());

        // Measured from the first item, not the latest.
        tokio::time::advance(Duration::from_millis(20)).await;
        let batch = b.flush_if_timed_out().unwrap();
        assert_eq!(batch.items, 2);
        assert_eq!(&batch.payload[..], b"xy");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_restarts_with_next_batch() {
        let mut b = batcher(2, 40, Separator::None);
        b.enqueue(Bytes::from_static(b"1"));
        b.enqueue(Bytes::from_static(b"2"));
        tokio::time::advance(Duration::from_millis(100)).await;
        b.enqueue(Bytes::from_static(b"3"));
        assert!(b.flush_if_timed_out().is_none());
    }

    #[test]
    fn empty_batcher_never_flushes() {
        let mut b = batcher(5, 0, Separator::None);
        assert!(b.flush_if_timed_out().is_none());
        assert!(b.flush_remaining().is_none());
    }
}
