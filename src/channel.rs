//! Publish/subscribe fan-out for engine streams.
//!
//! A [`PubSubChannel`] broadcasts every published item to each subscriber
//! registered at the moment `publish` is called. Each [`Subscriber`] owns a
//! bounded inbox; dropping it (or calling [`Subscriber::unsubscribe`])
//! removes it from the channel.
//!
//! # Backpressure
//!
//! What happens when an inbox is full is decided per channel by
//! [`DeliveryPolicy`]. The default, [`DeliveryPolicy::Block`], waits on each
//! subscriber in turn, so a stalled subscriber stalls the whole broadcast.
//! The other policies trade completeness for isolation.
//!
//! Every inbox keeps one slot in reserve for the terminal item published by
//! [`PubSubChannel::publish_terminal`]. Regular items never take it, under
//! any policy, so end-of-stream always fits without waiting, even for a
//! subscriber that stopped reading.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

/// Default number of items a subscriber inbox holds.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// What `publish` does when a subscriber's inbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Wait until the subscriber has room, one subscriber at a time.
    ///
    /// "Room" excludes the reserved terminal slot.
    #[default]
    Block,
    /// Drop the new item for that subscriber only.
    DropNewest,
    /// Wait up to the given duration per subscriber, then drop the item for it.
    BlockWithTimeout(Duration),
}

struct Registry<T> {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<T>)>,
}

struct Shared<T> {
    registry: Mutex<Registry<T>>,
    capacity: usize,
    policy: DeliveryPolicy,
}

impl<T> Shared<T> {
    fn remove(&self, id: u64) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        registry.subscribers.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.subscribers.iter().any(|(sub_id, _)| *sub_id == id)
    }

    fn snapshot(&self) -> Vec<(u64, mpsc::Sender<T>)> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.subscribers.clone()
    }
}

/// Broadcast channel with per-subscriber bounded inboxes.
pub struct PubSubChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PubSubChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for PubSubChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubChannel")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

impl<T> Default for PubSubChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY, DeliveryPolicy::default())
    }
}

impl<T> PubSubChannel<T> {
    /// Create a channel whose subscribers each buffer up to `capacity` items.
    pub fn new(capacity: usize, policy: DeliveryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    subscribers: Vec::new(),
                }),
                capacity: capacity.max(1),
                policy,
            }),
        }
    }

    /// Register a new subscriber. It only sees items published from now on.
    pub fn subscribe(&self) -> Subscriber<T> {
        // One extra slot is reserved for the terminal item.
        let (tx, rx) = mpsc::channel(self.shared.capacity + 1);
        let id = {
            let mut registry = self
                .shared
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.push((id, tx));
            id
        };
        log::debug!("[PubSub] Subscriber {id} registered");
        Subscriber {
            id,
            rx,
            channel: Arc::downgrade(&self.shared),
            registered: true,
        }
    }

    /// Remove a subscriber. Removing one that is already gone is a no-op.
    pub fn unsubscribe(&self, subscriber: &Subscriber<T>) -> bool {
        self.shared.remove(subscriber.id)
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Delivery policy of this channel.
    pub fn policy(&self) -> DeliveryPolicy {
        self.shared.policy
    }
}

impl<T: Clone> PubSubChannel<T> {
    /// Deliver `item` to every subscriber registered right now.
    ///
    /// Returns the number of subscribers whose inbox accepted the item.
    /// Subscribers that disappear during delivery are skipped silently.
    pub async fn publish(&self, item: T) -> usize {
        let mut delivered = 0;
        for (_, tx) in self.shared.snapshot() {
            let accepted = match self.shared.policy {
                DeliveryPolicy::Block => send_regular(&tx, item.clone()).await,
                DeliveryPolicy::DropNewest => {
                    let accepted = try_send_regular(&tx, item.clone());
                    if !accepted && !tx.is_closed() {
                        log::warn!("[PubSub] Subscriber inbox full, dropping item");
                    }
                    accepted
                }
                DeliveryPolicy::BlockWithTimeout(limit) => {
                    match tokio::time::timeout(limit, send_regular(&tx, item.clone())).await {
                        Ok(accepted) => accepted,
                        Err(_) => {
                            log::warn!(
                                "[PubSub] Subscriber did not accept item within {:?}, dropping it",
                                limit
                            );
                            false
                        }
                    }
                }
            };
            if accepted {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a terminal item, using the reserved inbox slot when needed.
    ///
    /// Falls back to waiting for room if the reserved slot is already taken,
    /// so the terminal item is never dropped for a live subscriber. Each
    /// subscriber is unregistered once it has the item: nothing published
    /// afterwards reaches it, and `recv` returns `None` after the terminal
    /// item is drained.
    pub async fn publish_terminal(&self, item: T) -> usize {
        let mut delivered = 0;
        for (id, tx) in self.shared.snapshot() {
            let accepted = match tx.try_send(item.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(item)) => tx.send(item).await.is_ok(),
                Err(TrySendError::Closed(_)) => false,
            };
            self.shared.remove(id);
            if accepted {
                delivered += 1;
            }
        }
        delivered
    }

    /// Non-blocking variant of [`publish_terminal`](Self::publish_terminal).
    ///
    /// A subscriber whose inbox (reserved slot included) is full does not get
    /// the item, but is still unregistered so its `recv` ends with `None`
    /// once drained. Usable from synchronous contexts such as drop guards.
    pub fn try_publish_terminal(&self, item: T) -> usize {
        let mut delivered = 0;
        for (id, tx) in self.shared.snapshot() {
            match tx.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("[PubSub] Subscriber {id} inbox full, closing it without end marker");
                }
                Err(TrySendError::Closed(_)) => {}
            }
            self.shared.remove(id);
        }
        delivered
    }

    /// Deliver `item` without waiting. Full or closed inboxes are skipped.
    pub fn try_publish(&self, item: T) -> usize {
        self.shared
            .snapshot()
            .into_iter()
            .filter(|(_, tx)| try_send_regular(tx, item.clone()))
            .count()
    }
}

/// Send a regular item once the inbox has room beyond the reserved slot.
async fn send_regular<T>(tx: &mpsc::Sender<T>, item: T) -> bool {
    // Holding two permits proves the reserved slot is still free after this send.
    match tx.reserve_many(2).await {
        Ok(mut permits) => permits.next().map(|permit| permit.send(item)).is_some(),
        Err(_) => false,
    }
}

/// Non-blocking [`send_regular`].
fn try_send_regular<T>(tx: &mpsc::Sender<T>, item: T) -> bool {
    match tx.try_reserve_many(2) {
        Ok(mut permits) => permits.next().map(|permit| permit.send(item)).is_some(),
        Err(_) => false,
    }
}

/// One consumer's view of a [`PubSubChannel`].
///
/// Dropping the subscriber unregisters it.
pub struct Subscriber<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    channel: Weak<Shared<T>>,
    registered: bool,
}

impl<T> std::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl<T> Subscriber<T> {
    /// Wait for the next item.
    ///
    /// Returns `None` once the subscriber is unregistered (or the channel
    /// is gone) and its inbox has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next item if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving new items. Already buffered items stay readable.
    pub fn unsubscribe(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Some(shared) = self.channel.upgrade() {
            shared.remove(self.id);
            log::debug!("[PubSub] Subscriber {} unregistered", self.id);
        }
    }

    /// Whether this subscriber is still registered with its channel.
    pub fn is_registered(&self) -> bool {
        self.registered
            && self
                .channel
                .upgrade()
                .is_some_and(|shared| shared.contains(self.id))
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_registered() {
        let channel = PubSubChannel::new(8, DeliveryPolicy::Block);
        let mut subs: Vec<_> = (0..5).map(|_| channel.subscribe()).collect();

        assert_eq!(channel.publish(42).await, 5);
        for sub in &mut subs {
            assert_eq!(sub.recv().await, Some(42));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_items() {
        let channel = PubSubChannel::new(8, DeliveryPolicy::Block);
        let mut early = channel.subscribe();
        channel.publish("first").await;
        let mut late = channel.subscribe();
        channel.publish("second").await;

        assert_eq!(early.recv().await, Some("first"));
        assert_eq!(early.recv().await, Some("second"));
        assert_eq!(late.recv().await, Some("second"));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let channel = PubSubChannel::new(64, DeliveryPolicy::Block);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        for i in 0..50 {
            channel.publish(i).await;
        }
        for i in 0..50 {
            assert_eq!(a.recv().await, Some(i));
            assert_eq!(b.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let channel: PubSubChannel<u32> = PubSubChannel::default();
        let sub = channel.subscribe();
        let _other = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);
        drop(sub);
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(channel.publish(1).await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let channel: PubSubChannel<u32> = PubSubChannel::default();
        let mut sub = channel.subscribe();
        assert!(channel.unsubscribe(&sub));
        assert!(!channel.unsubscribe(&sub));
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_registered());
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_buffered_items_survive_unsubscribe() {
        let channel = PubSubChannel::new(8, DeliveryPolicy::Block);
        let mut sub = channel.subscribe();
        channel.publish(1).await;
        sub.unsubscribe();
        channel.publish(2).await;
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_delivery_does_not_skip_others() {
        let channel = PubSubChannel::new(1, DeliveryPolicy::Block);
        let mut first = channel.subscribe();
        let blocked = channel.subscribe();
        let mut last = channel.subscribe();

        // Fill every inbox (the reserved slot stays free).
        channel.publish(0).await;
        assert_eq!(first.recv().await, Some(0));

        let publisher = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.publish(1).await })
        };

        // The publisher is now stuck on `blocked`; dropping it must let the
        // broadcast move on to `last`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(blocked);
        assert_eq!(last.recv().await, Some(0));

        let delivered = tokio::time::timeout(Duration::from_secs(2), publisher)
            .await
            .expect("publish stalled")
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await, Some(1));
        assert_eq!(last.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_drop_newest_isolates_slow_subscriber() {
        let channel = PubSubChannel::new(2, DeliveryPolicy::DropNewest);
        let mut slow = channel.subscribe();
        let mut fast = channel.subscribe();

        for i in 0..5 {
            channel.publish(i).await;
            assert_eq!(fast.recv().await, Some(i));
        }
        assert_eq!(slow.try_recv(), Some(0));
        assert_eq!(slow.try_recv(), Some(1));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn test_terminal_uses_reserved_slot() {
        let channel = PubSubChannel::new(2, DeliveryPolicy::DropNewest);
        let mut sub = channel.subscribe();
        channel.publish(Some(1)).await;
        channel.publish(Some(2)).await;
        channel.publish(Some(3)).await; // dropped
        assert_eq!(channel.publish_terminal(None).await, 1);

        assert_eq!(sub.recv().await, Some(Some(1)));
        assert_eq!(sub.recv().await, Some(Some(2)));
        assert_eq!(sub.recv().await, Some(None));
        assert!(!sub.is_registered());
    }

    #[tokio::test]
    async fn test_terminal_delivered_exactly_once() {
        let channel = PubSubChannel::new(4, DeliveryPolicy::Block);
        let mut sub = channel.subscribe();
        channel.publish(Some(1)).await;
        assert_eq!(channel.publish_terminal(None).await, 1);
        assert_eq!(channel.publish_terminal(None).await, 0);
        assert_eq!(channel.publish(Some(2)).await, 0);

        assert_eq!(sub.recv().await, Some(Some(1)));
        assert_eq!(sub.recv().await, Some(None));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_try_publish_terminal_reaches_full_blocking_inbox() {
        let channel = PubSubChannel::new(1, DeliveryPolicy::Block);
        let mut full = channel.subscribe();
        let mut idle = channel.subscribe();
        channel.publish(1).await;
        assert_eq!(idle.recv().await, Some(1));

        // `full` never read: its regular slot is taken, the reserved one is not.
        let blocked = tokio::time::timeout(Duration::from_millis(20), channel.publish(2)).await;
        assert!(blocked.is_err());

        assert_eq!(channel.try_publish_terminal(0), 2);
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(full.recv().await, Some(1));
        assert_eq!(full.recv().await, Some(0));
        assert_eq!(full.recv().await, None);
        assert_eq!(idle.recv().await, Some(0));
        assert_eq!(idle.recv().await, None);
    }

    #[tokio::test]
    async fn test_block_with_timeout_moves_on() {
        let channel = PubSubChannel::new(1, DeliveryPolicy::BlockWithTimeout(Duration::from_millis(20)));
        let _stalled = channel.subscribe();
        let mut live = channel.subscribe();

        for i in 0..3 {
            channel.publish(i).await;
            assert_eq!(live.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_try_publish_skips_full_inboxes() {
        let channel = PubSubChannel::new(1, DeliveryPolicy::Block);
        let mut sub = channel.subscribe();
        assert_eq!(channel.try_publish(1), 1);
        assert_eq!(channel.try_publish(2), 0); // only the reserved slot is left
        assert_eq!(channel.try_publish_terminal(3), 1);
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_channel_dropped_ends_subscriber() {
        let channel: PubSubChannel<u8> = PubSubChannel::default();
        let mut sub = channel.subscribe();
        drop(channel);
        assert_eq!(sub.recv().await, None);
        assert!(!sub.is_registered());
    }
}
