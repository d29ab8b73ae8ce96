//! Subscription and notification bus.
//!
//! Every subscriber owns an unbounded channel. The entity store publishes a
//! snapshot after each observable change, while it still holds its own lock,
//! so all subscribers of a key receive the same snapshots in the same order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::time::Instant;
use tracing::debug;

use super::keys::QueryKey;
use super::lock::mutex_lock;
use super::store::CacheEntry;

const SOURCE: &str = "cache::events";

/// Monotonic counter for ordering publications of one key.
pub type Epoch = u64;

pub type SubscriberId = u64;

struct Channel {
    subscribers: Vec<(SubscriberId, UnboundedSender<CacheEntry>)>,
    idle_since: Option<Instant>,
}

type ChannelMap = Mutex<HashMap<QueryKey, Channel>>;

pub struct NotificationBus {
    channels: Arc<ChannelMap>,
    next_id: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber and hand it `initial` before anything else.
    pub(crate) fn register(&self, initial: CacheEntry) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = initial.key.clone();
        let _ = sender.send(initial);

        let mut channels = mutex_lock(&self.channels, SOURCE, "register");
        let channel = channels.entry(key.clone()).or_insert_with(|| Channel {
            subscribers: Vec::new(),
            idle_since: None,
        });
        channel.subscribers.push((id, sender));
        channel.idle_since = None;

        debug!(key = %key, subscriber = id, "Subscriber registered");

        Subscription {
            key,
            id,
            receiver,
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Deliver `entry` to every subscriber of its key.
    pub(crate) fn publish(&self, entry: &CacheEntry) {
        let mut channels = mutex_lock(&self.channels, SOURCE, "publish");
        let Some(channel) = channels.get_mut(&entry.key) else {
            return;
        };
        channel
            .subscribers
            .retain(|(_, sender)| sender.send(entry.clone()).is_ok());
        if channel.subscribers.is_empty() && channel.idle_since.is_none() {
            channel.idle_since = Some(Instant::now());
        }
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        mutex_lock(&self.channels, SOURCE, "subscriber_count")
            .get(key)
            .map_or(0, |channel| channel.subscribers.len())
    }

    /// When the key lost its last subscriber, or `None` if it is observed or
    /// was never subscribed.
    pub(crate) fn idle_since(&self, key: &QueryKey) -> Option<Instant> {
        mutex_lock(&self.channels, SOURCE, "idle_since")
            .get(key)
            .and_then(|channel| channel.idle_since)
    }

    /// Forget the bookkeeping of an evicted key that nobody observes.
    pub(crate) fn forget_idle(&self, key: &QueryKey) {
        let mut channels = mutex_lock(&self.channels, SOURCE, "forget_idle");
        if channels
            .get(key)
            .is_some_and(|channel| channel.subscribers.is_empty())
        {
            channels.remove(key);
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a key subscription. Dropping it unsubscribes.
pub struct Subscription {
    key: QueryKey,
    id: SubscriberId,
    receiver: UnboundedReceiver<CacheEntry>,
    channels: Weak<ChannelMap>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next snapshot. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CacheEntry> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CacheEntry> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything queued and keep the most recent snapshot.
    pub fn latest(&mut self) -> Option<CacheEntry> {
        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok(entry) => latest = Some(entry),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return latest,
            }
        }
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.receiver.try_recv() {
            entries.push(entry);
        }
        entries
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = mutex_lock(&channels, SOURCE, "unsubscribe");
        if let Some(channel) = channels.get_mut(&self.key) {
            channel.subscribers.retain(|(id, _)| *id != self.id);
            if channel.subscribers.is_empty() {
                channel.idle_since = Some(Instant::now());
            }
        }
        debug!(key = %self.key, subscriber = self.id, "Subscriber released");
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::store::FetchStatus;

    fn entry(key: QueryKey, epoch: Epoch) -> CacheEntry {
        CacheEntry {
            key,
            data: None,
            status: FetchStatus::Stale,
            last_updated: None,
            error: None,
            subscribers: 0,
            pending_mutations: 0,
            epoch,
        }
    }

    #[tokio::test]
    async fn initial_snapshot_arrives_first() {
        let bus = NotificationBus::new();
        let mut sub = bus.register(entry(QueryKey::Memos, 1));
        bus.publish(&entry(QueryKey::Memos, 2));

        assert_eq!(sub.recv().await.map(|e| e.epoch), Some(1));
        assert_eq!(sub.recv().await.map(|e| e.epoch), Some(2));
    }

    #[test]
    fn subscribers_see_identical_sequences() {
        let bus = NotificationBus::new();
        let mut first = bus.register(entry(QueryKey::Memos, 0));
        let mut second = bus.register(entry(QueryKey::Memos, 0));

        for epoch in 1..=3 {
            bus.publish(&entry(QueryKey::Memos, epoch));
        }
        bus.publish(&entry(QueryKey::UncompletedTasks, 99));

        let a: Vec<_> = first.drain().into_iter().map(|e| e.epoch).collect();
        let b: Vec<_> = second.drain().into_iter().map(|e| e.epoch).collect();
        assert_eq!(a, vec![0, 1, 2, 3]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn dropping_last_subscriber_marks_key_idle() {
        let bus = NotificationBus::new();
        let first = bus.register(entry(QueryKey::Memos, 0));
        let second = bus.register(entry(QueryKey::Memos, 0));
        assert_eq!(bus.subscriber_count(&QueryKey::Memos), 2);
        assert!(bus.idle_since(&QueryKey::Memos).is_none());

        drop(first);
        assert!(bus.idle_since(&QueryKey::Memos).is_none());
        second.unsubscribe();
        assert_eq!(bus.subscriber_count(&QueryKey::Memos), 0);
        assert!(bus.idle_since(&QueryKey::Memos).is_some());

        bus.forget_idle(&QueryKey::Memos);
        assert!(bus.idle_since(&QueryKey::Memos).is_none());
    }

    #[test]
    fn latest_keeps_most_recent_value() {
        let bus = NotificationBus::new();
        let mut sub = bus.register(entry(QueryKey::Memos, 0));
        bus.publish(&entry(QueryKey::Memos, 5));
        bus.publish(&entry(QueryKey::Memos, 6));
        assert_eq!(sub.latest().map(|e| e.epoch), Some(6));
        assert!(sub.latest().is_none());
    }

    #[test]
    fn bus_recovers_from_poisoned_lock() {
        let bus = NotificationBus::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = bus.channels.lock().expect("bus lock should be acquired");
            panic!("poison bus lock");
        }));

        let _sub = bus.register(entry(QueryKey::Memos, 0));
        assert_eq!(bus.subscriber_count(&QueryKey::Memos), 1);
    }
}
