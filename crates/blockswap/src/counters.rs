//! Exchange-wide traffic counters.

use std::sync::{Mutex, PoisonError};

use blockswap_core::{BlockId, PeerId};

/// A consistent view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Blocks received from peers, duplicates included.
    pub blocks_received: u64,
    pub data_received: u64,
    /// Received blocks we already had.
    pub dup_blocks_received: u64,
    pub dup_data_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub messages_received: u64,
}

impl CounterSnapshot {
    /// Received blocks that were new to us.
    pub fn unique_blocks_received(&self) -> u64 {
        self.blocks_received - self.dup_blocks_received
    }
}

/// Counters guarded by a single lock so related fields move together.
#[derive(Debug, Default)]
pub struct Counters {
    inner: Mutex<CounterSnapshot>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut CounterSnapshot)) {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn record_received(&self, bytes: usize, duplicate: bool) {
        self.update(|c| {
            c.blocks_received += 1;
            c.data_received += bytes as u64;
            if duplicate {
                c.dup_blocks_received += 1;
                c.dup_data_received += bytes as u64;
            }
        });
    }

    pub fn record_sent(&self, blocks: usize, bytes: usize) {
        self.update(|c| {
            c.blocks_sent += blocks as u64;
            c.data_sent += bytes as u64;
        });
    }

    pub fn record_message(&self) {
        self.update(|c| c.messages_received += 1);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exchange status report.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Outstanding wants.
    pub wantlist: Vec<BlockId>,
    /// Connected peers.
    pub peers: Vec<PeerId>,
    /// Newly stored blocks waiting to be announced.
    pub provide_buf_len: usize,
    pub counters: CounterSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_counted_separately() {
        let counters = Counters::new();
        counters.record_received(10, false);
        counters.record_received(10, true);

        let snap = counters.snapshot();
        assert_eq!(snap.blocks_received, 2);
        assert_eq!(snap.data_received, 20);
        assert_eq!(snap.dup_blocks_received, 1);
        assert_eq!(snap.dup_data_received, 10);
        assert_eq!(snap.unique_blocks_received(), 1);
    }

    #[test]
    fn test_sent_and_messages() {
        let counters = Counters::new();
        counters.record_sent(3, 300);
        counters.record_message();
        counters.record_message();

        let snap = counters.snapshot();
        assert_eq!(snap.blocks_sent, 3);
        assert_eq!(snap.data_sent, 300);
        assert_eq!(snap.messages_received, 2);
    }

    proptest! {
        #[test]
        fn prop_duplicates_never_exceed_received(
            receipts in prop::collection::vec((0usize..4096, any::<bool>()), 0..64),
        ) {
            let counters = Counters::new();
            for (len, dup) in &receipts {
                counters.record_received(*len, *dup);
            }

            let snap = counters.snapshot();
            let dups = receipts.iter().filter(|(_, d)| *d).count() as u64;
            prop_assert_eq!(snap.blocks_received, receipts.len() as u64);
            prop_assert_eq!(snap.dup_blocks_received, dups);
            prop_assert!(snap.dup_data_received <= snap.data_received);
            prop_assert_eq!(snap.unique_blocks_received(), receipts.len() as u64 - dups);
        }
    }
}
