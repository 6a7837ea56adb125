//! The exchange coordinator.
//!
//! [`Exchange`] ties the store, the network, the serving ledger and the
//! want manager together. Callers ask it for blocks with
//! [`Exchange::get_blocks`]. Peers feed it through
//! [`Exchange::receive_message`], usually via the inbound pump worker.
//!
//! A fetch subscribes to the notification bus before anything else, serves
//! what the store already has, announces the rest, and only then waits.
//! If nothing has arrived after the provider search delay it asks the
//! provider pipeline to look for holders of the missing blocks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use blockswap_core::{Block, BlockId, PeerId};
use blockswap_ledger::{Engine, Ledger, LedgerReceipt};
use blockswap_net::{BlockMessage, NetError, Network};
use blockswap_store::BlockStore;

use crate::config::{ExchangeConfig, ProviderSearch};
use crate::counters::{Counters, Stat};
use crate::error::{ExchangeError, Result};
use crate::notifications::{PubSub, Subscription};
use crate::session::{Session, SessionRegistry, SessionShared};
use crate::wantmanager::WantManager;
use crate::workers::{self, ActiveQueries, BlockRequest, WorkerChannels};

/// State shared by the exchange handle, its fetches and its workers.
pub(crate) struct Shared {
    pub(crate) config: ExchangeConfig,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) notifications: PubSub,
    pub(crate) want_manager: WantManager,
    pub(crate) counters: Counters,
    pub(crate) provider_queries: ActiveQueries,
    pub(crate) find_keys: mpsc::Sender<BlockRequest>,
    pub(crate) shutdown: CancellationToken,
    new_blocks: mpsc::Sender<BlockId>,
    sessions: Mutex<SessionRegistry>,
    next_session_id: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<Option<String>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on a running block exchange. Cheap to clone.
///
/// Background workers run until [`Exchange::close`] is called or the last
/// handle (sessions included) is dropped. Dropping stops the workers without
/// waiting for them, so a worker panic then goes unreported.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Shared>,
    /// Present on handles given out to callers. Workers and fetches hold
    /// handles without it so they cannot keep the exchange alive.
    handle: Option<Arc<DropGuard>>,
}

impl Exchange {
    /// Start an exchange over the given components.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: ExchangeConfig,
        network: Arc<dyn Network>,
        store: Arc<dyn BlockStore>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (find_keys, find_keys_rx) = mpsc::channel(config.find_keys_buffer.max(1));
        let (new_blocks, new_blocks_rx) = mpsc::channel(config.has_block_buffer.max(1));

        let exchange = Self {
            handle: Some(Arc::new(shutdown.clone().drop_guard())),
            inner: Arc::new(Shared {
                want_manager: WantManager::new(Arc::clone(&network), shutdown.child_token()),
                config,
                store,
                network,
                ledger,
                notifications: PubSub::new(),
                counters: Counters::new(),
                provider_queries: ActiveQueries::default(),
                find_keys,
                shutdown,
                new_blocks,
                sessions: Mutex::new(SessionRegistry::default()),
                next_session_id: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        };

        let supervisor = workers::spawn(
            exchange.internal(),
            WorkerChannels {
                find_keys: find_keys_rx,
                new_blocks: new_blocks_rx,
            },
        );
        *lock(&exchange.inner.supervisor) = Some(supervisor);

        info!(peer = %exchange.local_peer(), "exchange started");
        exchange
    }

    /// Start an exchange served by the default [`Engine`] over `store`.
    pub fn with_engine(
        config: ExchangeConfig,
        network: Arc<dyn Network>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        let ledger = Arc::new(Engine::new(Arc::clone(&store)));
        Self::new(config, network, store, ledger)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner
    }

    /// A handle that does not keep the exchange running.
    pub(crate) fn internal(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            handle: None,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, SessionRegistry> {
        lock(&self.inner.sessions)
    }

    fn next_session(&self, cancel: &CancellationToken, ephemeral: bool) -> Arc<SessionShared> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = SessionShared::new(id, cancel.child_token(), ephemeral);
        self.sessions().insert(&session);
        session
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ExchangeError::Closed);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fetching
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch `ids`, yielding each block once as it becomes available.
    ///
    /// The stream closes when every block was delivered or `cancel` fires.
    /// Cancellation only truncates the stream; the caller tells "not found
    /// in time" apart from success by what it received. An empty request
    /// yields a closed stream.
    ///
    /// # Errors
    ///
    /// `Closed` if the exchange was shut down, or a store error while
    /// checking for local copies.
    pub async fn get_blocks(
        &self,
        cancel: &CancellationToken,
        ids: Vec<BlockId>,
    ) -> Result<mpsc::Receiver<Block>> {
        if ids.is_empty() {
            return Ok(closed_stream());
        }
        self.ensure_open()?;
        let session = self.next_session(cancel, true);
        self.fetch(&session, cancel, ids).await
    }

    /// Fetch a single block.
    ///
    /// # Errors
    ///
    /// `Cancelled` if `cancel` fired first, `Closed` if the exchange shut
    /// down before the block arrived.
    pub async fn get_block(&self, cancel: &CancellationToken, id: BlockId) -> Result<Block> {
        let rx = self.get_blocks(cancel, vec![id]).await?;
        Self::first_block(rx, cancel).await
    }

    pub(crate) async fn first_block(
        mut rx: mpsc::Receiver<Block>,
        cancel: &CancellationToken,
    ) -> Result<Block> {
        tokio::select! {
            biased;
            block = rx.recv() => match block {
                Some(block) => Ok(block),
                None if cancel.is_cancelled() => Err(ExchangeError::Cancelled),
                None => Err(ExchangeError::Closed),
            },
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
        }
    }

    pub(crate) async fn fetch(
        &self,
        session: &Arc<SessionShared>,
        cancel: &CancellationToken,
        ids: Vec<BlockId>,
    ) -> Result<mpsc::Receiver<Block>> {
        if ids.is_empty() {
            return Ok(closed_stream());
        }
        self.ensure_open()?;

        let mut seen = HashSet::new();
        let ids: Vec<BlockId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();

        // Subscribe before looking at the store so a block stored in between
        // is not missed.
        let subscription = self.inner.notifications.subscribe(&ids);

        let mut local = Vec::new();
        let mut missing = Vec::new();
        for id in &ids {
            match self.inner.store.get(id).await {
                Ok(block) => local.push(block),
                Err(err) if err.is_not_found() => missing.push(*id),
                Err(err) => {
                    if session.is_ephemeral() {
                        self.sessions().remove(session.id());
                    }
                    return Err(err.into());
                }
            }
        }

        if !missing.is_empty() {
            self.sessions().add_interest(session, &missing);
            self.inner
                .want_manager
                .want_blocks(&missing, &[], session.id());
        }
        debug!(
            session = session.id(),
            local = local.len(),
            missing = missing.len(),
            "fetch started"
        );

        let (out, rx) = mpsc::channel(1);
        let fetch = Fetch {
            exchange: self.internal(),
            session: Arc::clone(session),
            cancel: cancel.child_token(),
            remaining: missing,
            out,
        };
        tokio::spawn(fetch.run(local, subscription));
        Ok(rx)
    }

    /// Open a session that groups several fetches under one id.
    pub fn new_session(&self, cancel: &CancellationToken) -> Session {
        let shared = self.next_session(cancel, false);
        Session::new(self.clone(), shared)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a locally produced block, waking anyone waiting for it.
    pub async fn has_block(&self, block: Block) -> Result<()> {
        self.receive_block_from(block, None).await
    }

    async fn receive_block_from(&self, block: Block, from: Option<PeerId>) -> Result<()> {
        self.ensure_open()?;
        let id = block.id();

        if let Err(err) = self.inner.store.put(&block).await {
            error!(block = %id, error = %err, "failed to store block");
            return Err(err.into());
        }

        self.inner.notifications.publish(&block);

        let interested = self.sessions().take_interested(&id);
        for session in interested {
            session.receive_block_from(from, &block);
            self.inner
                .want_manager
                .cancel_wants(&[id], &[], session.id());
        }

        self.inner.ledger.add_block(&block).await;

        if self.inner.config.provide_enabled {
            tokio::select! {
                _ = self.inner.new_blocks.send(id) => {}
                _ = self.inner.shutdown.cancelled() => {}
            }
        }
        Ok(())
    }

    /// Handle a message from `from`.
    ///
    /// The ledger sees the message first, then every carried block is
    /// stored concurrently. Returns once all of them are processed.
    ///
    /// # Errors
    ///
    /// `Closed` after shutdown, otherwise the first block that failed to
    /// store.
    pub async fn receive_message(&self, from: PeerId, message: BlockMessage) -> Result<()> {
        self.ensure_open()?;
        self.inner.counters.record_message();
        self.inner.ledger.message_received(&from, &message).await;

        let blocks = message.into_blocks();
        if blocks.is_empty() {
            return Ok(());
        }

        let mut receipts = JoinSet::new();
        for block in blocks {
            let exchange = self.internal();
            receipts.spawn(async move {
                exchange.update_receive_counters(&block).await;
                debug!(block = %block.id(), peer = %from, "received block");
                exchange.receive_block_from(block, Some(from)).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = receipts.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(peer = %from, error = %err, "block receipt failed");
                    first_error.get_or_insert(err);
                }
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => {}
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn update_receive_counters(&self, block: &Block) {
        // Racy against a concurrent put of the same block; a duplicate may
        // go uncounted.
        match self.inner.store.has(&block.id()).await {
            Ok(had) => self.inner.counters.record_received(block.len(), had),
            Err(err) => debug!(block = %block.id(), error = %err, "has check failed"),
        }
    }

    /// Report a transport error. Logged only.
    pub fn receive_error(&self, err: &NetError) {
        warn!(error = %err, "network error");
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        self.inner.want_manager.connected(*peer);
        self.inner.ledger.peer_connected(peer);
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.want_manager.disconnected(peer);
        self.inner.ledger.peer_disconnected(peer);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Identifiers we are currently asking peers for.
    pub fn get_wantlist(&self) -> Vec<BlockId> {
        self.inner
            .want_manager
            .wantlist()
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }

    /// What `peer` has asked us for.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<BlockId> {
        self.inner
            .ledger
            .wantlist_for_peer(peer)
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<LedgerReceipt> {
        self.inner.ledger.ledger_for_peer(peer)
    }

    pub fn stat(&self) -> Stat {
        let new_blocks = &self.inner.new_blocks;
        Stat {
            wantlist: self.get_wantlist(),
            peers: self.inner.want_manager.connected_peers(),
            provide_buf_len: new_blocks.max_capacity() - new_blocks.capacity(),
            counters: self.inner.counters.snapshot(),
        }
    }

    /// Provider searches currently running.
    pub fn active_provider_queries(&self) -> usize {
        self.inner.provider_queries.len()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.network.local_peer()
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    pub fn is_online(&self) -> bool {
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop every worker and wait for them to exit.
    ///
    /// # Errors
    ///
    /// `WorkerPanicked` if a background worker crashed.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.notifications.shutdown();
        self.inner.ledger.shutdown();

        let supervisor = lock(&self.inner.supervisor).take();
        let failure = match supervisor {
            Some(handle) => match handle.await {
                Ok(failure) => failure,
                Err(err) => Some(err.to_string()),
            },
            None => None,
        };
        self.inner.want_manager.shutdown().await;
        self.sessions().prune();

        match failure {
            Some(message) => Err(ExchangeError::WorkerPanicked(message)),
            None => {
                info!(peer = %self.local_peer(), "exchange closed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("peer", &self.local_peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_stream() -> mpsc::Receiver<Block> {
    let (_, rx) = mpsc::channel(1);
    rx
}

/// One in-flight fetch.
struct Fetch {
    exchange: Exchange,
    session: Arc<SessionShared>,
    cancel: CancellationToken,
    /// Not yet delivered, in request order.
    remaining: Vec<BlockId>,
    out: mpsc::Sender<Block>,
}

impl Fetch {
    async fn run(mut self, local: Vec<Block>, mut subscription: Subscription) {
        for block in local {
            if !self.send(block).await {
                return self.finish();
            }
        }

        let shared = Arc::clone(self.exchange.shared());
        let find_keys = shared.find_keys.clone();
        let shutdown = shared.shutdown.clone();
        let cancel = self.cancel.clone();
        let session_cancel = self.session.token().clone();

        let search = tokio::time::sleep(shared.config.provider_search_delay);
        tokio::pin!(search);
        let mut search_armed = true;
        let mut pending: Vec<BlockRequest> = Vec::new();

        while !self.remaining.is_empty() {
            tokio::select! {
                biased;
                block = subscription.recv() => {
                    let Some(block) = block else { break };
                    if !self.remaining.contains(&block.id()) {
                        continue;
                    }
                    // Something is arriving; no need to search.
                    search_armed = false;
                    pending.clear();
                    if !self.deliver(block).await {
                        break;
                    }
                }
                _ = &mut search, if search_armed => {
                    search_armed = false;
                    pending = self.search_requests(shared.config.provider_search);
                    pending.reverse();
                }
                permit = find_keys.reserve(), if !pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(request) = pending.pop() {
                            permit.send(request);
                        }
                    }
                    Err(_) => pending.clear(),
                },
                _ = cancel.cancelled() => break,
                _ = session_cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
            }
        }
        self.finish();
    }

    fn search_requests(&self, strategy: ProviderSearch) -> Vec<BlockRequest> {
        let ids: &[BlockId] = match strategy {
            ProviderSearch::FirstKey => &self.remaining[..1.min(self.remaining.len())],
            ProviderSearch::EveryKey => &self.remaining,
        };
        ids.iter()
            .map(|id| BlockRequest {
                id: *id,
                cancel: self.cancel.clone(),
            })
            .collect()
    }

    async fn deliver(&mut self, block: Block) -> bool {
        let id = block.id();
        self.remaining.retain(|r| *r != id);
        self.exchange
            .shared()
            .want_manager
            .cancel_wants(&[id], &[], self.session.id());
        self.send(block).await
    }

    /// Hand `block` to the caller. A ready receiver wins over cancellation.
    async fn send(&self, block: Block) -> bool {
        let shutdown = &self.exchange.shared().shutdown;
        tokio::select! {
            biased;
            sent = self.out.send(block) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
            _ = self.session.token().cancelled() => false,
            _ = shutdown.cancelled() => false,
        }
    }

    fn finish(self) {
        self.cancel.cancel();
        let shared = self.exchange.shared();
        if !self.remaining.is_empty() {
            shared
                .want_manager
                .cancel_wants(&self.remaining, &[], self.session.id());
        }

        let mut sessions = self.exchange.sessions();
        if self.session.is_ephemeral() {
            self.session.token().cancel();
            sessions.remove(self.session.id());
        } else {
            sessions.remove_interest(&self.session, &self.remaining);
        }
        debug!(
            session = self.session.id(),
            undelivered = self.remaining.len(),
            "fetch finished"
        );
    }
}
