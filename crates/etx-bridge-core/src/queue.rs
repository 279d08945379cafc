// ── Ingest queue ──
//
// Bounded FIFO between the UDP receive loop (single producer) and the
// publish consumer (single consumer). The mutex is never held across an
// await; `Notify` wakes the consumer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub payload: Bytes,
    pub source: SocketAddr,
}

/// Bounded packet queue with a configurable overflow policy.
#[derive(Debug)]
pub struct IngestQueue {
    items: Mutex<VecDeque<UdpPacket>>,
    capacity: usize,
    policy: OverflowPolicy,
    ready: Notify,
}

impl IngestQueue {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            ready: Notify::new(),
        }
    }

    /// Enqueue a packet.
    ///
    /// When full, `DropOldest` evicts the head and accepts; `RejectNew`
    /// returns `false` and leaves the queue untouched.
    pub fn offer(&self, packet: UdpPacket) -> bool {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                    }
                    OverflowPolicy::RejectNew => return false,
                }
            }
            items.push_back(packet);
        }
        self.ready.notify_one();
        true
    }

    /// Take the head, waiting up to `timeout` for one to arrive.
    ///
    /// A timeout too large to represent as a deadline waits indefinitely.
    pub async fn poll(&self, timeout: Duration) -> Option<UdpPacket> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if let Some(packet) = self.try_poll() {
                return Some(packet);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, self.ready.notified())
                        .await
                        .is_err()
                    {
                        return self.try_poll();
                    }
                }
                None => self.ready.notified().await,
            }
        }
    }

    /// Take the head without waiting.
    pub fn try_poll(&self) -> Option<UdpPacket> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<UdpPacket>> {
        // A panic while holding this lock cannot leave the deque inconsistent.
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
