//! Block generators and proptest strategies.

use proptest::prelude::*;
use rand::RngCore;

use blockswap_core::{Block, BlockId, PeerId};

/// Produces distinct blocks in a fixed order.
#[derive(Debug, Default)]
pub struct BlockGenerator {
    seq: u64,
}

impl BlockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> Block {
        self.seq += 1;
        Block::new(format!("block {}", self.seq).into_bytes())
    }

    pub fn blocks(&mut self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.next()).collect()
    }
}

/// `count` blocks of `size` random bytes.
pub fn random_blocks(count: usize, size: usize) -> Vec<Block> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut data = vec![0u8; size];
            rng.fill_bytes(&mut data);
            Block::new(data)
        })
        .collect()
}

/// Generate a random BlockId.
pub fn block_id() -> impl Strategy<Value = BlockId> {
    any::<[u8; 32]>().prop_map(BlockId::from_bytes)
}

/// Generate a random PeerId.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(PeerId::from_bytes)
}

/// Generate a block of up to `max_len` bytes.
pub fn block(max_len: usize) -> impl Strategy<Value = Block> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(|data| Block::new(data))
}

/// Generate up to `max_count` distinct blocks.
pub fn distinct_blocks(max_count: usize, max_len: usize) -> impl Strategy<Value = Vec<Block>> {
    prop::collection::vec(block(max_len), 0..=max_count).prop_map(|blocks| {
        let mut seen = std::collections::HashSet::new();
        blocks.into_iter().filter(|b| seen.insert(b.id())).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_generator_is_deterministic() {
        let first = BlockGenerator::new().blocks(5);
        let second = BlockGenerator::new().blocks(5);
        assert_eq!(first, second);

        let ids: std::collections::HashSet<_> = first.iter().map(Block::id).collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_random_blocks_sizes() {
        let blocks = random_blocks(3, 64);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.len() == 64));
    }

    proptest! {
        #[test]
        fn prop_generated_blocks_verify(block in block(256)) {
            prop_assert!(block.verify().is_ok());
        }

        #[test]
        fn prop_distinct_blocks_are_distinct(blocks in distinct_blocks(16, 8)) {
            let ids: std::collections::HashSet<_> = blocks.iter().map(Block::id).collect();
            prop_assert_eq!(ids.len(), blocks.len());
        }
    }
}
