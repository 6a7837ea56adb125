//! Outgoing want-list management.
//!
//! The [`WantManager`] owns this node's session-tracked want-list and one
//! outbound message queue per connected peer. Want and cancel updates are
//! broadcast to every queue, or to an explicit set of peers for session
//! requests. A newly connected peer first receives the full want-list.
//!
//! Each queue is drained by its own task, which coalesces everything that
//! piled up since its last send into a single message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use blockswap_core::{
    BlockId, PeerId, SessionId, SessionTrackedWantlist, WantEntry, MAX_PRIORITY,
};
use blockswap_net::{BlockMessage, Network, WantlistEntry};

struct PeerQueue {
    tx: mpsc::UnboundedSender<BlockMessage>,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks what we want and keeps connected peers informed.
pub struct WantManager {
    network: Arc<dyn Network>,
    // Lock order: `peers` before `wantlist`.
    wantlist: Mutex<SessionTrackedWantlist>,
    peers: Mutex<HashMap<PeerId, PeerQueue>>,
    shutdown: CancellationToken,
}

impl WantManager {
    pub fn new(network: Arc<dyn Network>, shutdown: CancellationToken) -> Self {
        Self {
            network,
            wantlist: Mutex::new(SessionTrackedWantlist::new()),
            peers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Add `ids` to the want-list on behalf of `session`.
    ///
    /// Earlier identifiers get higher priority. With no target `peers` the
    /// update is broadcast and carries only identifiers that were not wanted
    /// before; a targeted update carries all of them.
    pub fn want_blocks(&self, ids: &[BlockId], peers: &[PeerId], session: SessionId) {
        let queues = lock(&self.peers);
        let mut wantlist = lock(&self.wantlist);
        let mut entries = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            let priority = MAX_PRIORITY.saturating_sub(index as i32);
            let added = wantlist.add(*id, priority, session);
            if added || !peers.is_empty() {
                entries.push(WantlistEntry {
                    id: *id,
                    priority,
                    cancel: false,
                });
            }
        }
        // Queued while both guards are held so peers see updates in the
        // order they were applied.
        send_to(&queues, entries, peers);
    }

    /// Withdraw `session`'s interest in `ids`.
    ///
    /// Peers are told to cancel an identifier only once no session wants it.
    pub fn cancel_wants(&self, ids: &[BlockId], peers: &[PeerId], session: SessionId) {
        let queues = lock(&self.peers);
        let mut wantlist = lock(&self.wantlist);
        let entries: Vec<WantlistEntry> = ids
            .iter()
            .filter(|id| wantlist.remove(id, session))
            .map(|id| WantlistEntry {
                id: *id,
                priority: 0,
                cancel: true,
            })
            .collect();
        send_to(&queues, entries, peers);
    }

    /// Start a queue for `peer` and send it the full want-list.
    pub fn connected(&self, peer: PeerId) {
        let mut peers = lock(&self.peers);
        if peers.contains_key(&peer) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let entries = lock(&self.wantlist).entries();
        if !entries.is_empty() {
            let _ = tx.send(BlockMessage::full_wantlist(entries));
        }

        let task = tokio::spawn(run_queue(
            Arc::clone(&self.network),
            peer,
            rx,
            self.shutdown.clone(),
        ));
        peers.insert(peer, PeerQueue { tx, task });
        debug!(peer = %peer, "peer queue started");
    }

    /// Drop `peer`'s queue. Pending updates are still flushed.
    pub fn disconnected(&self, peer: &PeerId) {
        if lock(&self.peers).remove(peer).is_some() {
            debug!(peer = %peer, "peer queue stopped");
        }
    }

    /// Send blocks straight to `peer`, bypassing its queue.
    pub async fn send_blocks(
        &self,
        peer: &PeerId,
        message: BlockMessage,
    ) -> blockswap_net::Result<()> {
        self.network.send_message(peer, message).await
    }

    pub fn wantlist(&self) -> Vec<WantEntry> {
        lock(&self.wantlist).entries()
    }

    pub fn wants(&self, id: &BlockId) -> bool {
        lock(&self.wantlist).contains(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.wantlist).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.wantlist).is_empty()
    }

    /// Peers with a running queue, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.peers).keys().copied().collect();
        peers.sort();
        peers
    }

    /// Stop every queue and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let queues: Vec<PeerQueue> = lock(&self.peers).drain().map(|(_, q)| q).collect();
        for queue in queues {
            drop(queue.tx);
            let _ = queue.task.await;
        }
    }
}

fn send_to(queues: &HashMap<PeerId, PeerQueue>, entries: Vec<WantlistEntry>, targets: &[PeerId]) {
    if entries.is_empty() {
        return;
    }
    let mut message = BlockMessage::new();
    message.extend(entries);

    if targets.is_empty() {
        for queue in queues.values() {
            let _ = queue.tx.send(message.clone());
        }
        return;
    }
    for peer in targets {
        if let Some(queue) = queues.get(peer) {
            let _ = queue.tx.send(message.clone());
        }
    }
}

async fn run_queue(
    network: Arc<dyn Network>,
    peer: PeerId,
    mut rx: mpsc::UnboundedReceiver<BlockMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let mut message = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        while let Ok(later) = rx.try_recv() {
            message.merge(later);
        }
        if message.is_empty() {
            continue;
        }

        trace!(peer = %peer, entries = message.wantlist().len(), "sending want-list update");
        for part in message.split() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = network.send_message(&peer, part) => {
                    if let Err(err) = result {
                        warn!(peer = %peer, error = %err, "want-list update failed");
                    }
                }
            }
        }
    }
}
