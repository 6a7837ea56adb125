//! The serving-ledger seam.
//!
//! The exchange tells the ledger about every message it receives and sends
//! and every block that becomes available locally. The ledger decides what
//! to send to whom and hands ready work to the exchange's task workers
//! through an [`Outbox`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use blockswap_core::{Block, PeerId, WantEntry};
use blockswap_net::BlockMessage;

use crate::ledger::LedgerReceipt;

/// Blocks ready to be sent to one peer.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub peer: PeerId,
    /// In the order the ledger wants them sent.
    pub blocks: Vec<Block>,
}

impl Envelope {
    /// The wire message carrying this envelope's blocks.
    pub fn to_message(&self) -> BlockMessage {
        BlockMessage::with_blocks(self.blocks.iter().cloned())
    }

    pub fn byte_len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }
}

/// A slot the ledger fills with the next envelope once one is ready.
pub type EnvelopeSlot = oneshot::Receiver<Envelope>;

/// Multi-consumer handle on the ledger's queue of envelope slots.
///
/// Any number of workers may call [`Outbox::next`] concurrently; each slot is
/// handed to exactly one of them.
#[derive(Clone)]
pub struct Outbox {
    slots: Arc<Mutex<mpsc::Receiver<EnvelopeSlot>>>,
}

impl Outbox {
    /// Create an outbox and the sender the ledger publishes slots on.
    pub fn channel(capacity: usize) -> (mpsc::Sender<EnvelopeSlot>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                slots: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Take the next slot. Returns `None` once the ledger has shut down.
    pub async fn next(&self) -> Option<EnvelopeSlot> {
        self.slots.lock().await.recv().await
    }
}

/// Serving ledger consulted by the exchange.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Where ready-to-send envelopes appear.
    fn outbox(&self) -> Outbox;

    /// Account for an inbound message: want-list deltas and received bytes.
    async fn message_received(&self, peer: &PeerId, message: &BlockMessage);

    /// Account for a message the exchange finished sending.
    fn message_sent(&self, peer: &PeerId, message: &BlockMessage);

    /// A block became available locally.
    async fn add_block(&self, block: &Block);

    /// What `peer` has told us it wants.
    fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantEntry>;

    /// Accounting snapshot for `peer`, if we have ever exchanged with it.
    fn ledger_for_peer(&self, peer: &PeerId) -> Option<LedgerReceipt>;

    fn peer_connected(&self, peer: &PeerId);

    fn peer_disconnected(&self, peer: &PeerId);

    /// Stop producing envelopes.
    fn shutdown(&self) {}
}
