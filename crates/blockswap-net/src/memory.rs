//! An in-process network for tests and simulation.
//!
//! Every node gets a [`MemoryAdapter`] registered on a shared
//! [`MemoryNetwork`]. Messages go through the real wire codec, connections
//! are tracked per pair of peers, and a provider registry stands in for a
//! routing system. New provider records are fanned out to every node that
//! subscribed to announcements.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use blockswap_core::{BlockId, PeerId};

use crate::error::{NetError, Result};
use crate::messages::BlockMessage;
use crate::network::{Network, NetworkEvent};

/// Tunables for a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryNetworkConfig {
    /// Capacity of each node's inbound queue.
    pub inbox_capacity: usize,
    /// How long a provider search takes before yielding results.
    pub search_latency: Duration,
}

impl Default for MemoryNetworkConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            search_latency: Duration::ZERO,
        }
    }
}

/// Per-identifier provider search counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Searches started.
    pub calls: usize,
    /// Searches currently running.
    pub in_flight: usize,
    /// Most searches ever running at once.
    pub peak_in_flight: usize,
}

enum Inbound {
    Message { from: PeerId, bytes: Vec<u8> },
    Connected(PeerId),
    Disconnected(PeerId),
}

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared state for the memory network.
pub struct MemoryNetwork {
    config: MemoryNetworkConfig,
    nodes: RwLock<HashMap<PeerId, mpsc::Sender<Inbound>>>,
    connections: RwLock<HashSet<(PeerId, PeerId)>>,
    providers: RwLock<HashMap<BlockId, Vec<PeerId>>>,
    searches: Mutex<HashMap<BlockId, SearchStats>>,
    announcements: Mutex<HashMap<PeerId, mpsc::Sender<BlockId>>>,
}

impl MemoryNetwork {
    /// Create a new memory network with default settings.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryNetworkConfig::default())
    }

    pub fn with_config(config: MemoryNetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashSet::new()),
            providers: RwLock::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            announcements: Mutex::new(HashMap::new()),
        })
    }

    /// Register a node and return its endpoint.
    pub async fn adapter(self: &Arc<Self>, peer: PeerId) -> MemoryAdapter {
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity);
        self.nodes.write().await.insert(peer, tx);

        MemoryAdapter {
            local: peer,
            network: Arc::clone(self),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Connect two registered peers. Both sides see `PeerConnected` the first
    /// time the pair is connected.
    pub async fn connect(&self, a: PeerId, b: PeerId) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let (to_a, to_b) = {
            let nodes = self.nodes.read().await;
            let to_a = nodes.get(&a).cloned().ok_or(NetError::PeerNotFound(a))?;
            let to_b = nodes.get(&b).cloned().ok_or(NetError::PeerNotFound(b))?;
            (to_a, to_b)
        };

        if !self.connections.write().await.insert(pair(a, b)) {
            return Ok(());
        }
        tracing::debug!(a = %a, b = %b, "memory peers connected");

        to_a.send(Inbound::Connected(b))
            .await
            .map_err(|_| NetError::Closed)?;
        to_b.send(Inbound::Connected(a))
            .await
            .map_err(|_| NetError::Closed)?;
        Ok(())
    }

    /// Drop the connection between two peers, notifying both.
    pub async fn disconnect(&self, a: PeerId, b: PeerId) {
        if !self.connections.write().await.remove(&pair(a, b)) {
            return;
        }
        let nodes = self.nodes.read().await;
        if let Some(tx) = nodes.get(&a) {
            let _ = tx.send(Inbound::Disconnected(b)).await;
        }
        if let Some(tx) = nodes.get(&b) {
            let _ = tx.send(Inbound::Disconnected(a)).await;
        }
    }

    pub async fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        self.connections.read().await.contains(&pair(a, b))
    }

    /// Peers that announced `id`.
    pub async fn providers_of(&self, id: &BlockId) -> Vec<PeerId> {
        self.providers
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Search counters for `id`.
    pub fn search_stats(&self, id: &BlockId) -> SearchStats {
        self.searches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    fn search_started(&self, id: BlockId) {
        let mut searches = self.searches.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = searches.entry(id).or_default();
        stats.calls += 1;
        stats.in_flight += 1;
        stats.peak_in_flight = stats.peak_in_flight.max(stats.in_flight);
    }

    /// Tell every subscriber except `provider` that it announced `id`.
    /// A subscriber whose feed is full misses the record.
    fn announce(&self, provider: PeerId, id: BlockId) {
        let mut subscribers = self
            .announcements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|_, tx| !tx.is_closed());
        for (peer, tx) in subscribers.iter() {
            if *peer != provider && tx.try_send(id).is_err() {
                tracing::debug!(peer = %peer, block = %id, "announcement feed full");
            }
        }
    }

    fn search_finished(&self, id: BlockId) {
        let mut searches = self.searches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = searches.get_mut(&id) {
            stats.in_flight = stats.in_flight.saturating_sub(1);
        }
    }
}

/// Marks a search finished however its task ends.
struct SearchGuard {
    network: Arc<MemoryNetwork>,
    id: BlockId,
}

impl Drop for SearchGuard {
    fn drop(&mut self) {
        self.network.search_finished(self.id);
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
pub struct MemoryAdapter {
    local: PeerId,
    network: Arc<MemoryNetwork>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

impl MemoryAdapter {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Drop the connection to `peer`.
    pub async fn disconnect(&self, peer: &PeerId) {
        self.network.disconnect(self.local, *peer).await;
    }
}

#[async_trait]
impl Network for MemoryAdapter {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send_message(&self, peer: &PeerId, message: BlockMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.network.connect(self.local, *peer).await?;

        let sender = self
            .network
            .nodes
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or(NetError::PeerNotFound(*peer))?;
        sender
            .send(Inbound::Message {
                from: self.local,
                bytes,
            })
            .await
            .map_err(|_| NetError::Closed)
    }

    async fn recv(&self) -> Result<NetworkEvent> {
        let mut rx = self.receiver.lock().await;
        match rx.recv().await {
            Some(Inbound::Message { from, bytes }) => Ok(NetworkEvent::Message {
                from,
                message: BlockMessage::from_bytes(&bytes)?,
            }),
            Some(Inbound::Connected(peer)) => Ok(NetworkEvent::PeerConnected(peer)),
            Some(Inbound::Disconnected(peer)) => Ok(NetworkEvent::PeerDisconnected(peer)),
            None => Err(NetError::Closed),
        }
    }

    async fn connect_to(&self, peer: &PeerId) -> Result<()> {
        self.network.connect(self.local, *peer).await
    }

    fn find_providers(
        &self,
        id: BlockId,
        max: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PeerId> {
        let (tx, rx) = mpsc::channel(max.max(1));
        let network = Arc::clone(&self.network);
        let local = self.local;

        network.search_started(id);
        tokio::spawn(async move {
            let _guard = SearchGuard {
                network: Arc::clone(&network),
                id,
            };

            let latency = network.config.search_latency;
            if !latency.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(latency) => {}
                    _ = cancel.cancelled() => return,
                }
            }

            let providers = network.providers_of(&id).await;
            for peer in providers.into_iter().filter(|p| *p != local).take(max) {
                tokio::select! {
                    sent = tx.send(peer) => if sent.is_err() { return },
                    _ = cancel.cancelled() => return,
                }
            }
        });
        rx
    }

    async fn provide(&self, id: &BlockId) -> Result<()> {
        let added = {
            let mut providers = self.network.providers.write().await;
            let entry = providers.entry(*id).or_default();
            let added = !entry.contains(&self.local);
            if added {
                entry.push(self.local);
            }
            added
        };
        if added {
            self.network.announce(self.local, *id);
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let connections = self.network.connections.read().await;
        let mut peers: Vec<PeerId> = connections
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.local {
                    Some(*b)
                } else if *b == self.local {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers
    }

    fn subscribe_announcements(&self) -> Option<mpsc::Receiver<BlockId>> {
        let (tx, rx) = mpsc::channel(self.network.config.inbox_capacity.max(1));
        self.network
            .announcements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.local, tx);
        Some(rx)
    }
}
