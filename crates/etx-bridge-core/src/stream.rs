// ── Reactive state stream ──
//
// Subscription type for consuming `BridgeState` transitions.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::controller::BridgeState;

/// A subscription to the bridge state.
///
/// Provides point-in-time access plus change notification via
/// `changed()` or by converting into a `Stream`.
pub struct StateStream {
    current: BridgeState,
    receiver: watch::Receiver<BridgeState>,
}

impl StateStream {
    pub(crate) fn new(receiver: watch::Receiver<BridgeState>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// State captured at creation or at the last `changed()`.
    pub fn current(&self) -> &BridgeState {
        &self.current
    }

    pub fn latest(&self) -> BridgeState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next transition. Returns `None` once the controller
    /// has been dropped.
    pub async fn changed(&mut self) -> Option<BridgeState> {
        self.receiver.changed().await.ok()?;
        let state = self.receiver.borrow_and_update().clone();
        self.current = state.clone();
        Some(state)
    }

    /// Wait until `predicate` holds for the current or a later state.
    pub async fn wait_for(&mut self, predicate: impl Fn(&BridgeState) -> bool) -> Option<BridgeState> {
        let state = self.receiver.wait_for(|s| predicate(s)).await.ok()?.clone();
        self.current = state.clone();
        Some(state)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> StateWatchStream {
        StateWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding every observed `BridgeState`, starting with
/// the current one.
pub struct StateWatchStream {
    inner: WatchStream<BridgeState>,
}

impl Stream for StateWatchStream {
    type Item = BridgeState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn tracks_transitions() {
        let (tx, rx) = watch::channel(BridgeState::Idle);
        let mut stream = StateStream::new(rx);
        assert_eq!(stream.current(), &BridgeState::Idle);

        tx.send_replace(BridgeState::Starting);
        assert_eq!(stream.changed().await, Some(BridgeState::Starting));
        assert_eq!(stream.current(), &BridgeState::Starting);

        tx.send_replace(BridgeState::Error("boom".into()));
        let failed = stream
            .wait_for(|s| matches!(s, BridgeState::Error(_)))
            .await
            .unwrap();
        assert_eq!(failed, BridgeState::Error("boom".into()));

        drop(tx);
        assert_eq!(stream.changed().await, None);
    }

    #[tokio::test]
    async fn stream_yields_current_then_changes() {
        let (tx, rx) = watch::channel(BridgeState::Idle);
        let mut stream = StateStream::new(rx).into_stream();
        assert_eq!(stream.next().await, Some(BridgeState::Idle));

        tx.send_replace(BridgeState::Starting);
        assert_eq!(stream.next().await, Some(BridgeState::Starting));
    }
}
