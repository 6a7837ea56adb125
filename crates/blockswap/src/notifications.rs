//! In-process notification bus for arriving blocks.
//!
//! Waiters subscribe to a set of identifiers before asking the network for
//! them. Each subscription sees each of its blocks at most once and closes
//! once all of them have been delivered or the bus shuts down. Publishing
//! never blocks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use blockswap_core::{Block, BlockId};

struct Subscriber {
    tx: mpsc::UnboundedSender<Block>,
    remaining: HashSet<BlockId>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
    index: HashMap<BlockId, HashSet<u64>>,
    closed: bool,
}

impl BusState {
    fn unsubscribe(&mut self, sub: u64) {
        let Some(subscriber) = self.subscribers.remove(&sub) else {
            return;
        };
        for id in subscriber.remaining {
            if let Some(subs) = self.index.get_mut(&id) {
                subs.remove(&sub);
                if subs.is_empty() {
                    self.index.remove(&id);
                }
            }
        }
    }
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish/subscribe hub keyed by block identifier.
#[derive(Default)]
pub struct PubSub {
    state: Arc<Mutex<BusState>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `ids`. Dropping the subscription unsubscribes.
    ///
    /// After [`PubSub::shutdown`] the returned subscription is already closed.
    pub fn subscribe(&self, ids: &[BlockId]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;

        if !state.closed && !ids.is_empty() {
            let remaining: HashSet<BlockId> = ids.iter().copied().collect();
            for block_id in &remaining {
                state.index.entry(*block_id).or_default().insert(id);
            }
            state.subscribers.insert(id, Subscriber { tx, remaining });
        }

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Wake every subscription waiting for `block`.
    pub fn publish(&self, block: &Block) {
        let id = block.id();
        let mut state = lock(&self.state);
        let Some(waiting) = state.index.remove(&id) else {
            return;
        };

        for sub in waiting {
            let done = match state.subscribers.get_mut(&sub) {
                Some(subscriber) => {
                    if subscriber.remaining.remove(&id) {
                        let _ = subscriber.tx.send(block.clone());
                    }
                    subscriber.remaining.is_empty()
                }
                None => false,
            };
            if done {
                state.subscribers.remove(&sub);
            }
        }
    }

    /// Close every subscription and refuse new ones.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
        state.index.clear();
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }
}

/// A stream of blocks from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Block>,
    bus: Weak<Mutex<BusState>>,
}

impl Subscription {
    /// Next delivered block, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Block> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            lock(&bus).unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_each_block_once_then_closes() {
        let bus = PubSub::new();
        let a = Block::new(&b"a"[..]);
        let b = Block::new(&b"b"[..]);
        let mut sub = bus.subscribe(&[a.id(), b.id()]);

        bus.publish(&a);
        bus.publish(&a);
        bus.publish(&b);

        assert_eq!(sub.recv().await, Some(a));
        assert_eq!(sub.recv().await, Some(b));
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_ignores_unrelated_blocks() {
        let bus = PubSub::new();
        let wanted = Block::new(&b"wanted"[..]);
        let mut sub = bus.subscribe(&[wanted.id()]);

        bus.publish(&Block::new(&b"other"[..]));
        let nothing = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = PubSub::new();
        bus.publish(&Block::new(&b"lonely"[..]));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = PubSub::new();
        let block = Block::new(&b"shared"[..]);
        let mut first = bus.subscribe(&[block.id()]);
        let mut second = bus.subscribe(&[block.id()]);

        bus.publish(&block);
        assert_eq!(first.recv().await, Some(block.clone()));
        assert_eq!(second.recv().await, Some(block));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = PubSub::new();
        let sub = bus.subscribe(&[BlockId::for_data(b"x")]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let bus = PubSub::new();
        let mut before = bus.subscribe(&[BlockId::for_data(b"x")]);
        bus.shutdown();
        let mut after = bus.subscribe(&[BlockId::for_data(b"y")]);

        assert_eq!(before.recv().await, None);
        assert_eq!(after.recv().await, None);
    }
}
