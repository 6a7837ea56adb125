//! Background workers.
//!
//! Every exchange runs:
//!
//! - `task_worker_count` task workers sending the ledger's envelopes,
//! - a provide collector and a provide worker announcing new blocks,
//! - a rebroadcast loop retrying provider searches for old wants,
//! - the provider query manager, which runs at most one search per block,
//! - the inbound pump feeding network events into the exchange,
//! - when enabled, a replicator fetching every block other peers announce.
//!
//! They share one [`JoinSet`] watched by a supervisor. A worker panic is
//! fatal: the supervisor cancels the exchange and records the panic for
//! [`Exchange::close`](crate::Exchange::close) to report.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use blockswap_core::BlockId;
use blockswap_ledger::Outbox;
use blockswap_net::{NetError, NetworkEvent};

use crate::context::with_timeout;
use crate::exchange::{Exchange, Shared};

/// A request to look for providers of `id`, live until `cancel` fires.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub id: BlockId,
    pub cancel: CancellationToken,
}

pub(crate) struct WorkerChannels {
    pub(crate) find_keys: mpsc::Receiver<BlockRequest>,
    pub(crate) new_blocks: mpsc::Receiver<BlockId>,
}

/// Identifiers with a provider search in flight.
#[derive(Clone, Default)]
pub(crate) struct ActiveQueries {
    active: Arc<Mutex<HashSet<BlockId>>>,
}

impl ActiveQueries {
    fn lock(&self) -> MutexGuard<'_, HashSet<BlockId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id`, or `None` if a search for it is already running.
    pub(crate) fn try_claim(&self, id: BlockId) -> Option<QueryGuard> {
        if !self.lock().insert(id) {
            return None;
        }
        Some(QueryGuard {
            queries: self.clone(),
            id,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Releases its claim on drop.
pub(crate) struct QueryGuard {
    queries: ActiveQueries,
    id: BlockId,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.queries.lock().remove(&self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Spawning and supervision
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn spawn(exchange: Exchange, channels: WorkerChannels) -> JoinHandle<Option<String>> {
    let shared = Arc::clone(exchange.shared());
    let config = &shared.config;
    let mut workers: JoinSet<&'static str> = JoinSet::new();

    for _ in 0..config.task_worker_count {
        let shared = Arc::clone(&shared);
        let outbox = shared.ledger.outbox();
        workers.spawn(async move {
            task_worker(shared, outbox).await;
            "task worker"
        });
    }

    if config.provide_enabled {
        let (provide_keys, provide_rx) = mpsc::channel(config.provide_keys_buffer.max(1));
        let shutdown = shared.shutdown.clone();
        workers.spawn(async move {
            collect_provides(channels.new_blocks, provide_keys, shutdown).await;
            "provide collector"
        });
        let provider = Arc::clone(&shared);
        workers.spawn(async move {
            provide_worker(provider, provide_rx).await;
            "provide worker"
        });
    }

    let rebroadcaster = Arc::clone(&shared);
    workers.spawn(async move {
        rebroadcast(rebroadcaster).await;
        "rebroadcast"
    });

    let querier = Arc::clone(&shared);
    let find_keys = channels.find_keys;
    workers.spawn(async move {
        provider_query_manager(querier, find_keys).await;
        "provider query manager"
    });

    if config.replicate_announced {
        match shared.network.subscribe_announcements() {
            Some(announced) => {
                let replicator = exchange.clone();
                workers.spawn(async move {
                    replicate_announced(replicator, announced).await;
                    "replicator"
                });
            }
            None => warn!("network has no announcement feed; replication disabled"),
        }
    }

    workers.spawn(async move {
        inbound_pump(exchange).await;
        "inbound pump"
    });

    tokio::spawn(supervise(workers, shared.shutdown.clone()))
}

async fn supervise(
    mut workers: JoinSet<&'static str>,
    shutdown: CancellationToken,
) -> Option<String> {
    let mut failure = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(name) => trace!(worker = name, "worker exited"),
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                error!(error = %message, "worker panicked; shutting down exchange");
                shutdown.cancel();
                failure.get_or_insert(message);
            }
            Err(_) => {}
        }
    }
    failure
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Re-raise a panic from a child task so it reaches the supervisor.
fn propagate_panic(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            std::panic::resume_unwind(err.into_panic());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serving
// ─────────────────────────────────────────────────────────────────────────────

async fn task_worker(shared: Arc<Shared>, outbox: Outbox) {
    let shutdown = shared.shutdown.clone();
    loop {
        let slot = tokio::select! {
            _ = shutdown.cancelled() => return,
            slot = outbox.next() => match slot {
                Some(slot) => slot,
                None => return,
            },
        };
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => return,
            envelope = slot => match envelope {
                Ok(envelope) => envelope,
                // The ledger abandoned this slot.
                Err(_) => continue,
            },
        };

        let message = envelope.to_message();
        let peer = envelope.peer;
        shared.ledger.message_sent(&peer, &message);
        debug!(peer = %peer, blocks = envelope.blocks.len(), "sending blocks");

        let sent = tokio::select! {
            _ = shutdown.cancelled() => return,
            sent = shared.want_manager.send_blocks(&peer, message) => sent,
        };
        match sent {
            Ok(()) => shared
                .counters
                .record_sent(envelope.blocks.len(), envelope.byte_len()),
            Err(err) => warn!(peer = %peer, error = %err, "failed to send blocks"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Announcing
// ─────────────────────────────────────────────────────────────────────────────

/// Relay `upstream` into `downstream` without ever blocking the sender.
///
/// Identifiers queue up while `downstream` is full. An identifier already
/// queued is not queued again. When `upstream` closes, the queue is flushed
/// and `downstream` closed.
pub(crate) async fn collect_provides(
    mut upstream: mpsc::Receiver<BlockId>,
    downstream: mpsc::Sender<BlockId>,
    shutdown: CancellationToken,
) {
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    let mut queued: HashSet<BlockId> = HashSet::new();
    let mut open = true;

    while open || !queue.is_empty() {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = upstream.recv(), if open => match next {
                Some(id) => {
                    if queued.insert(id) {
                        queue.push_back(id);
                    }
                }
                None => open = false,
            },
            permit = downstream.reserve(), if !queue.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(id) = queue.pop_front() {
                        queued.remove(&id);
                        permit.send(id);
                    }
                }
                Err(_) => break,
            },
        }
    }
}

async fn provide_worker(shared: Arc<Shared>, mut keys: mpsc::Receiver<BlockId>) {
    let shutdown = shared.shutdown.clone();
    let limit = Arc::new(Semaphore::new(shared.config.provide_worker_max.max(1)));
    let mut announcing = JoinSet::new();

    loop {
        let id = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = announcing.join_next(), if !announcing.is_empty() => {
                propagate_panic(joined);
                continue;
            }
            next = keys.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let network = Arc::clone(&shared.network);
        let timeout = shared.config.provide_timeout;
        announcing.spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, network.provide(&id)).await {
                Ok(Ok(())) => trace!(block = %id, "announced"),
                Ok(Err(err)) => warn!(block = %id, error = %err, "announce failed"),
                Err(_) => warn!(block = %id, "announce timed out"),
            }
        });
    }
    announcing.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider discovery
// ─────────────────────────────────────────────────────────────────────────────

async fn rebroadcast(shared: Arc<Shared>) {
    let shutdown = shared.shutdown.clone();
    let period = shared.config.rebroadcast_delay;
    let log_period = shared.config.wantlist_log_interval;
    let mut broadcast = interval_at(Instant::now() + period, period);
    broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut log_tick = interval_at(Instant::now() + log_period, log_period);
    log_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = log_tick.tick() => {
                let wanted = shared.want_manager.len();
                if wanted > 0 {
                    debug!(wanted, "keys in want-list");
                }
            }
            _ = broadcast.tick() => {
                let entries = shared.want_manager.wantlist();
                let choice = {
                    let mut rng = rand::thread_rng();
                    entries.choose(&mut rng).map(|e| e.id)
                };
                let Some(id) = choice else { continue };
                let request = BlockRequest {
                    id,
                    cancel: shutdown.child_token(),
                };
                trace!(block = %id, "rebroadcasting want");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = shared.find_keys.send(request) => {}
                }
            }
        }
    }
}

async fn provider_query_manager(shared: Arc<Shared>, mut requests: mpsc::Receiver<BlockRequest>) {
    let shutdown = shared.shutdown.clone();
    let mut searches = JoinSet::new();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = searches.join_next(), if !searches.is_empty() => {
                propagate_panic(joined);
                continue;
            }
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        if request.cancel.is_cancelled() {
            continue;
        }
        let Some(claim) = shared.provider_queries.try_claim(request.id) else {
            trace!(block = %request.id, "provider search already running");
            continue;
        };
        searches.spawn(search_providers(Arc::clone(&shared), request, claim));
    }
    searches.shutdown().await;
}

async fn search_providers(shared: Arc<Shared>, request: BlockRequest, _claim: QueryGuard) {
    let deadline = with_timeout(&request.cancel, shared.config.provider_request_timeout);
    let mut providers = shared.network.find_providers(
        request.id,
        shared.config.max_providers_per_request,
        deadline.clone(),
    );
    debug!(block = %request.id, "searching for providers");

    let mut connects = JoinSet::new();
    loop {
        let peer = tokio::select! {
            _ = deadline.cancelled() => break,
            next = providers.recv() => match next {
                Some(peer) => peer,
                None => break,
            },
        };
        let network = Arc::clone(&shared.network);
        let deadline = deadline.clone();
        connects.spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                connected = network.connect_to(&peer) => {
                    if let Err(err) = connected {
                        debug!(peer = %peer, error = %err, "failed to connect to provider");
                    }
                }
            }
        });
    }

    while let Some(joined) = connects.join_next().await {
        propagate_panic(joined);
    }
    deadline.cancel();
}

/// Fetch each announced block so this node keeps its own copy.
async fn replicate_announced(exchange: Exchange, mut announced: mpsc::Receiver<BlockId>) {
    let shared = Arc::clone(exchange.shared());
    let shutdown = shared.shutdown.clone();
    let timeout = shared.config.replication_timeout;
    let mut copies = JoinSet::new();

    loop {
        let id = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = copies.join_next(), if !copies.is_empty() => {
                propagate_panic(joined);
                continue;
            }
            next = announced.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        let exchange = exchange.clone();
        let cancel = with_timeout(&shutdown, timeout);
        copies.spawn(async move {
            match exchange.get_block(&cancel, id).await {
                Ok(_) => debug!(block = %id, "replicated announced block"),
                Err(err) => debug!(block = %id, error = %err, "replication failed"),
            }
            cancel.cancel();
        });
    }
    copies.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

async fn inbound_pump(exchange: Exchange) {
    let shared = Arc::clone(exchange.shared());
    let shutdown = shared.shutdown.clone();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = shared.network.recv() => event,
        };
        match event {
            Ok(NetworkEvent::Message { from, message }) => {
                if let Err(err) = exchange.receive_message(from, message).await {
                    debug!(peer = %from, error = %err, "message handling failed");
                }
            }
            Ok(NetworkEvent::PeerConnected(peer)) => exchange.peer_connected(&peer),
            Ok(NetworkEvent::PeerDisconnected(peer)) => exchange.peer_disconnected(&peer),
            Err(NetError::Closed) => return,
            Err(err) => exchange.receive_error(&err),
        }
    }
}
