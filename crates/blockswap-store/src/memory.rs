//! In-memory implementation of the BlockStore trait.
//!
//! Same semantics as SQLite but nothing is persisted.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use blockswap_core::{Block, BlockId};

use crate::error::{Result, StoreError};
use crate::traits::{BlockStore, PutResult};

/// In-memory block store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<BlockId, Block>>,
}

impl MemoryBlockStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, block: &Block) -> Result<PutResult> {
        block.verify()?;
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        if blocks.contains_key(&block.id()) {
            return Ok(PutResult::AlreadyExists);
        }
        blocks.insert(block.id(), block.clone());
        Ok(PutResult::Inserted)
    }

    async fn get(&self, id: &BlockId) -> Result<Block> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(id).cloned().ok_or(StoreError::NotFound(*id))
    }

    async fn has(&self, id: &BlockId) -> Result<bool> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.contains_key(id))
    }

    async fn delete(&self, id: &BlockId) -> Result<bool> {
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.remove(id).is_some())
    }

    async fn all_ids(&self) -> Result<Vec<BlockId>> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<BlockId> = blocks.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> Result<usize> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks.len())
    }
}
