//! Observable Streams
//!
//! Explicit publish-subscribe channel for observable interface members: a
//! multi-subscriber broadcast where every subscriber sees every value
//! published after it joined. Dropping a subscription unsubscribes it.
//!
//! The server side binds named channels into its dispatch table and
//! forwards published values to all connected clients as observable
//! envelopes; locally the same channel type serves in-process consumers.

use tokio::sync::broadcast;
use tracing::warn;

/// Multi-subscriber broadcast channel
#[derive(Debug, Clone)]
pub struct ObservableChannel<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> ObservableChannel<T> {
    /// Create a channel buffering up to `capacity` values per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a value to all current subscribers; returns how many
    /// subscribers received it. Zero subscribers is not an error.
    pub fn publish(&self, value: T) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    /// Subscribe; the handle yields values published from now on
    pub fn subscribe(&self) -> ObservableSubscription<T> {
        ObservableSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn raw_subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Cancellable subscription handle; dropping it unsubscribes
#[derive(Debug)]
pub struct ObservableSubscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> ObservableSubscription<T> {
    /// Next published value; `None` once the channel is gone. A slow
    /// subscriber that falls behind skips the overwritten values.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observable subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
