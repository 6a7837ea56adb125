//! BlockStore trait: the abstract interface for block persistence.

use async_trait::async_trait;
use blockswap_core::{Block, BlockId};

use crate::error::Result;

/// Result of storing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Block was stored.
    Inserted,
    /// Block was already present (idempotent - not an error).
    AlreadyExists,
}

/// Async interface for content-addressed block storage.
///
/// Implementations must tolerate concurrent calls from arbitrary tasks,
/// including concurrent puts of the same block.
#[async_trait]
pub trait BlockStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Block Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a block. Storing a block that is already present is not an error.
    async fn put(&self, block: &Block) -> Result<PutResult>;

    /// Store several blocks.
    async fn put_many(&self, blocks: &[Block]) -> Result<Vec<PutResult>> {
        let mut results = Vec::with_capacity(blocks.len());
        for block in blocks {
            results.push(self.put(block).await?);
        }
        Ok(results)
    }

    /// Fetch a block, failing with `StoreError::NotFound` if absent.
    async fn get(&self, id: &BlockId) -> Result<Block>;

    /// Check whether a block is present.
    async fn has(&self, id: &BlockId) -> Result<bool>;

    /// Remove a block. Returns true if it was present.
    async fn delete(&self, id: &BlockId) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Enumeration
    // ─────────────────────────────────────────────────────────────────────────

    /// Identifiers of every stored block.
    async fn all_ids(&self) -> Result<Vec<BlockId>>;

    /// Number of stored blocks.
    async fn count(&self) -> Result<usize>;
}
