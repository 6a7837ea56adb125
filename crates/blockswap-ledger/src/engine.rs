//! Reference serving ledger.
//!
//! Keeps a [`PeerLedger`] per partner and a [`PeerRequestQueue`] of blocks
//! owed to partners. A background task turns queued work into envelopes,
//! one slot at a time, as task workers ask for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use blockswap_core::{Block, BlockId, PeerId, WantEntry};
use blockswap_net::BlockMessage;
use blockswap_store::BlockStore;

use crate::ledger::{LedgerReceipt, PeerLedger};
use crate::queue::PeerRequestQueue;
use crate::traits::{Envelope, EnvelopeSlot, Ledger, Outbox};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Most blocks packed into one envelope.
    pub max_blocks_per_envelope: usize,
    /// Envelope slots published ahead of demand.
    pub outbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_envelope: 16,
            outbox_capacity: 1,
        }
    }
}

#[derive(Default)]
struct EngineState {
    ledgers: HashMap<PeerId, PeerLedger>,
    queue: PeerRequestQueue,
}

impl EngineState {
    fn ledger(&mut self, peer: &PeerId) -> &mut PeerLedger {
        self.ledgers
            .entry(*peer)
            .or_insert_with(|| PeerLedger::new(*peer))
    }
}

struct EngineInner {
    store: Arc<dyn BlockStore>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    work: Notify,
    shutdown: CancellationToken,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_envelope(&self) -> Option<Envelope> {
        loop {
            let next = self.state().queue.pop_batch(self.config.max_blocks_per_envelope);
            let Some((peer, tasks)) = next else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return None,
                    _ = self.work.notified() => continue,
                }
            };

            let mut blocks = Vec::with_capacity(tasks.len());
            for task in tasks {
                match self.store.get(&task.id).await {
                    Ok(block) => blocks.push(block),
                    Err(e) if e.is_not_found() => {
                        debug!(block = %task.id, peer = %peer, "queued block no longer stored")
                    }
                    Err(e) => warn!(block = %task.id, error = %e, "failed to load block to serve"),
                }
            }
            if !blocks.is_empty() {
                return Some(Envelope { peer, blocks });
            }
        }
    }

    async fn run(self: Arc<Self>, slots: mpsc::Sender<EnvelopeSlot>) {
        loop {
            let (tx, rx) = oneshot::channel();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                sent = slots.send(rx) => if sent.is_err() { return },
            }

            let Some(envelope) = self.next_envelope().await else {
                return;
            };
            if let Err(envelope) = tx.send(envelope) {
                debug!(peer = %envelope.peer, "envelope slot abandoned");
            }
        }
    }
}

/// Decision engine: accounting plus a fair serving queue.
pub struct Engine {
    inner: Arc<EngineInner>,
    outbox: Outbox,
}

impl Engine {
    /// Create an engine serving from `store` and start its envelope task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn BlockStore>, config: EngineConfig) -> Self {
        let (slots, outbox) = Outbox::channel(config.outbox_capacity);
        let inner = Arc::new(EngineInner {
            store,
            config,
            state: Mutex::new(EngineState::default()),
            work: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&inner).run(slots));
        Self { inner, outbox }
    }

    /// Blocks waiting to be served.
    pub fn pending_tasks(&self) -> usize {
        self.inner.state().queue.len()
    }

    fn queue_if_wanted(&self, peer: &PeerId, id: BlockId) -> bool {
        let mut state = self.inner.state();
        let Some(priority) = state.ledgers.get(peer).and_then(|l| l.wants_block(&id)) else {
            return false;
        };
        state.queue.push(*peer, id, priority)
    }
}

#[async_trait]
impl Ledger for Engine {
    fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    async fn message_received(&self, peer: &PeerId, message: &BlockMessage) {
        if message.is_empty() {
            debug!(peer = %peer, "received empty message");
            return;
        }

        let mut wanted = Vec::new();
        {
            let mut state = self.inner.state();
            if message.is_full() {
                state.ledger(peer).clear_wants();
                state.queue.remove_peer(peer);
            }
            for entry in message.wantlist() {
                if entry.cancel {
                    state.ledger(peer).cancel_want(&entry.id);
                    state.queue.remove(peer, &entry.id);
                } else {
                    state.ledger(peer).wants(entry.id, entry.priority);
                    wanted.push(entry.id);
                }
            }
            for block in message.blocks() {
                state.ledger(peer).received_bytes(block.len());
            }
        }

        let mut queued = false;
        for id in wanted {
            match self.inner.store.has(&id).await {
                Ok(true) => queued |= self.queue_if_wanted(peer, id),
                Ok(false) => {}
                Err(e) => warn!(block = %id, error = %e, "store lookup failed"),
            }
        }
        if queued {
            self.inner.work.notify_one();
        }
    }

    fn message_sent(&self, peer: &PeerId, message: &BlockMessage) {
        let mut state = self.inner.state();
        for block in message.blocks() {
            let ledger = state.ledger(peer);
            ledger.sent_bytes(block.len());
            ledger.cancel_want(&block.id());
            state.queue.remove(peer, &block.id());
        }
    }

    async fn add_block(&self, block: &Block) {
        let id = block.id();
        let mut queued = false;
        {
            let mut state = self.inner.state();
            let wanting: Vec<(PeerId, i32)> = state
                .ledgers
                .iter()
                .filter_map(|(peer, l)| l.wants_block(&id).map(|p| (*peer, p)))
                .collect();
            for (peer, priority) in wanting {
                queued |= state.queue.push(peer, id, priority);
            }
        }
        if queued {
            self.inner.work.notify_one();
        }
    }

    fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantEntry> {
        self.inner
            .state()
            .ledgers
            .get(peer)
            .map(PeerLedger::wantlist)
            .unwrap_or_default()
    }

    fn ledger_for_peer(&self, peer: &PeerId) -> Option<LedgerReceipt> {
        self.inner.state().ledgers.get(peer).map(PeerLedger::receipt)
    }

    fn peer_connected(&self, peer: &PeerId) {
        self.inner.state().ledger(peer).refs += 1;
    }

    fn peer_disconnected(&self, peer: &PeerId) {
        let mut state = self.inner.state();
        let Some(ledger) = state.ledgers.get_mut(peer) else {
            return;
        };
        ledger.refs = ledger.refs.saturating_sub(1);
        if ledger.refs == 0 {
            state.ledgers.remove(peer);
            state.queue.remove_peer(peer);
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
