//! Multi-node fixtures.
//!
//! Every instance runs a full [`Exchange`] with the default engine on a
//! shared [`MemoryNetwork`], backed by a [`DelayedBlockStore`] whose latency
//! tests can change at any time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use blockswap::{Exchange, ExchangeConfig};
use blockswap_core::{Block, BlockId, Identity, PeerId};
use blockswap_net::MemoryNetwork;
use blockswap_store::{BlockStore, MemoryBlockStore, PutResult, Result};

/// Timings suited to tests: short search delay, quick rebroadcast.
pub fn fast_config() -> ExchangeConfig {
    ExchangeConfig::default()
        .with_provider_search_delay(Duration::from_millis(50))
        .with_provider_request_timeout(Duration::from_secs(2))
        .with_rebroadcast_delay(Duration::from_millis(500))
        .with_task_workers(2)
}

// ─────────────────────────────────────────────────────────────────────────────
// Slow storage
// ─────────────────────────────────────────────────────────────────────────────

/// An in-memory store that sleeps before every operation.
#[derive(Default)]
pub struct DelayedBlockStore {
    inner: MemoryBlockStore,
    latency: Mutex<Duration>,
}

impl DelayedBlockStore {
    pub fn new(latency: Duration) -> Self {
        Self {
            inner: MemoryBlockStore::new(),
            latency: Mutex::new(latency),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BlockStore for DelayedBlockStore {
    async fn put(&self, block: &Block) -> Result<PutResult> {
        self.wait().await;
        self.inner.put(block).await
    }

    async fn get(&self, id: &BlockId) -> Result<Block> {
        self.wait().await;
        self.inner.get(id).await
    }

    async fn has(&self, id: &BlockId) -> Result<bool> {
        self.wait().await;
        self.inner.has(id).await
    }

    async fn delete(&self, id: &BlockId) -> Result<bool> {
        self.wait().await;
        self.inner.delete(id).await
    }

    async fn all_ids(&self) -> Result<Vec<BlockId>> {
        self.wait().await;
        self.inner.all_ids().await
    }

    async fn count(&self) -> Result<usize> {
        self.wait().await;
        self.inner.count().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instances
// ─────────────────────────────────────────────────────────────────────────────

/// One node under test.
pub struct Instance {
    pub peer: PeerId,
    pub exchange: Exchange,
    pub store: Arc<DelayedBlockStore>,
    pub network: Arc<MemoryNetwork>,
}

impl Instance {
    pub fn set_store_latency(&self, latency: Duration) {
        self.store.set_latency(latency);
    }

    /// Make `blocks` available on this node.
    pub async fn add_blocks(&self, blocks: &[Block]) -> anyhow::Result<()> {
        for block in blocks {
            self.exchange.has_block(block.clone()).await?;
        }
        Ok(())
    }

    pub async fn connect(&self, other: &Instance) -> anyhow::Result<()> {
        self.network.connect(self.peer, other.peer).await?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.exchange.close().await?;
        Ok(())
    }
}

/// Builds instances with deterministic identities on one network.
pub struct InstanceGenerator {
    network: Arc<MemoryNetwork>,
    config: ExchangeConfig,
    seq: u64,
}

impl Default for InstanceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceGenerator {
    pub fn new() -> Self {
        Self::with_network(MemoryNetwork::new())
    }

    pub fn with_network(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            config: fast_config(),
            seq: 0,
        }
    }

    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// A fresh, unconnected instance.
    pub async fn next(&mut self) -> Instance {
        self.seq += 1;
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&self.seq.to_be_bytes());
        let peer = Identity::from_seed(&seed).peer_id();

        let adapter = self.network.adapter(peer).await;
        let store = Arc::new(DelayedBlockStore::default());
        let exchange = Exchange::with_engine(self.config.clone(), Arc::new(adapter), store.clone());

        Instance {
            peer,
            exchange,
            store,
            network: Arc::clone(&self.network),
        }
    }

    /// `count` instances, every pair connected.
    pub async fn instances(&mut self, count: usize) -> anyhow::Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(count);
        for _ in 0..count {
            instances.push(self.next().await);
        }
        for (i, a) in instances.iter().enumerate() {
            for b in &instances[i + 1..] {
                a.connect(b).await?;
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_delayed_store_waits() {
        let store = DelayedBlockStore::new(Duration::from_millis(30));
        let block = Block::new(&b"slow"[..]);

        let started = Instant::now();
        store.put(&block).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));

        store.set_latency(Duration::ZERO);
        assert!(store.has(&block.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_are_fully_connected() {
        let mut gen = InstanceGenerator::new();
        let nodes = gen.instances(3).await.unwrap();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                assert!(gen.network().is_connected(a.peer, b.peer).await);
            }
        }
        for node in &nodes {
            node.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_identities_are_deterministic() {
        let first = InstanceGenerator::new().next().await;
        let second = InstanceGenerator::new().next().await;
        assert_eq!(first.peer, second.peer);
        first.close().await.unwrap();
        second.close().await.unwrap();
    }
}
