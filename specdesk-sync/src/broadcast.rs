//! Fan-out of change events to every subscriber of a project.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each
//! of which buffers up to `capacity` events. A subscriber that falls
//! further behind loses the oldest events and carries on. There is no
//! acknowledgement and no replay; a client that missed events catches up
//! with its next read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::protocol::ChangeEvent;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
}

/// Counters shared with every subscription, updated without locking.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// Broadcast group for one project.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of events buffered per subscriber before it
    /// starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Send an event to all current subscribers.
    ///
    /// Returns the number of subscribers it was queued for. Sending with no
    /// subscribers is not an error.
    pub fn broadcast(&self, event: ChangeEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Invoke `listener` for every event until the handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_change_event<F>(&self, mut listener: F) -> SubscriptionHandle
    where
        F: FnMut(Arc<ChangeEvent>) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                listener(event);
            }
        });
        SubscriptionHandle { task }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One subscriber's view of a [`BroadcastGroup`].
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    /// Next event, skipping over anything lost to lag.
    ///
    /// `None` once the group is gone.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscriber lagged, {} change events dropped", n);
                    self.stats.events_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Keeps an [`BroadcastGroup::on_change_event`] listener alive.
///
/// Dropping the handle stops the listener.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}

    /// Whether the listener has stopped because its group is gone.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
