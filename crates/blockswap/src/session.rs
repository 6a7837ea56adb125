//! Sessions: the unit of want-list ownership.
//!
//! Every fetch runs under a session id. [`Exchange::get_blocks`] makes a
//! throwaway session per call, while [`Exchange::new_session`] hands out a
//! long-lived [`Session`] that groups related fetches and remembers which
//! peers delivered to it.
//!
//! The exchange keeps only weak references to sessions. A session whose
//! handle was dropped or whose token was cancelled is pruned the next time
//! the registry is touched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blockswap_core::{Block, BlockId, PeerId, SessionId};

use crate::error::Result;
use crate::exchange::Exchange;

#[derive(Default)]
struct SessionState {
    interest: HashSet<BlockId>,
    peers: Vec<PeerId>,
    blocks_received: u64,
}

/// State shared between a session handle, its fetches and the registry.
pub(crate) struct SessionShared {
    id: SessionId,
    cancel: CancellationToken,
    ephemeral: bool,
    state: Mutex<SessionState>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, cancel: CancellationToken, ephemeral: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancel,
            ephemeral,
            state: Mutex::new(SessionState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn add_interest(&self, ids: &[BlockId]) {
        self.state().interest.extend(ids.iter().copied());
    }

    fn remove_interest(&self, ids: &[BlockId]) {
        let mut state = self.state();
        for id in ids {
            state.interest.remove(id);
        }
    }

    /// Record that `block` arrived, from `from` if it came off the wire.
    pub(crate) fn receive_block_from(&self, from: Option<PeerId>, block: &Block) {
        let mut state = self.state();
        if !state.interest.remove(&block.id()) {
            return;
        }
        state.blocks_received += 1;
        if let Some(peer) = from {
            if !state.peers.contains(&peer) {
                state.peers.push(peer);
            }
        }
    }

    pub(crate) fn interested_in(&self, id: &BlockId) -> bool {
        self.state().interest.contains(id)
    }

    pub(crate) fn peers(&self) -> Vec<PeerId> {
        self.state().peers.clone()
    }

    pub(crate) fn blocks_received(&self) -> u64 {
        self.state().blocks_received
    }
}

/// Weak index of live sessions and the identifiers each one waits for.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<SessionId, Weak<SessionShared>>,
    interest: HashMap<BlockId, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub(crate) fn insert(&mut self, session: &Arc<SessionShared>) {
        self.prune();
        self.sessions.insert(session.id(), Arc::downgrade(session));
    }

    pub(crate) fn add_interest(&mut self, session: &SessionShared, ids: &[BlockId]) {
        session.add_interest(ids);
        for id in ids {
            self.interest.entry(*id).or_default().insert(session.id());
        }
    }

    pub(crate) fn remove_interest(&mut self, session: &SessionShared, ids: &[BlockId]) {
        session.remove_interest(ids);
        for id in ids {
            self.unindex(id, session.id());
        }
    }

    fn unindex(&mut self, id: &BlockId, session: SessionId) {
        if let Some(sessions) = self.interest.get_mut(id) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.interest.remove(id);
            }
        }
    }

    /// Forget `session` entirely.
    pub(crate) fn remove(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        self.interest.retain(|_, sessions| {
            sessions.remove(&session);
            !sessions.is_empty()
        });
    }

    /// Detach every live session waiting for `id`.
    pub(crate) fn take_interested(&mut self, id: &BlockId) -> Vec<Arc<SessionShared>> {
        let Some(waiting) = self.interest.remove(id) else {
            return Vec::new();
        };
        waiting
            .into_iter()
            .filter_map(|sid| self.sessions.get(&sid).and_then(Weak::upgrade))
            .filter(|session| session.is_live())
            .collect()
    }

    /// Drop sessions whose handle is gone or whose token fired.
    pub(crate) fn prune(&mut self) {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, weak)| weak.upgrade().map_or(true, |s| !s.is_live()))
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.remove(id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// A long-lived fetch context obtained from [`Exchange::new_session`].
///
/// Fetches made through the same session share its want-list entries and
/// its record of delivering peers. Cancelling the token the session was
/// created with ends every fetch it is running.
#[derive(Clone)]
pub struct Session {
    exchange: Exchange,
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(exchange: Exchange, shared: Arc<SessionShared>) -> Self {
        Self { exchange, shared }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id()
    }

    /// Fetch `ids` under this session. See [`Exchange::get_blocks`].
    pub async fn get_blocks(
        &self,
        cancel: &CancellationToken,
        ids: Vec<BlockId>,
    ) -> Result<mpsc::Receiver<Block>> {
        self.exchange.fetch(&self.shared, cancel, ids).await
    }

    /// Fetch a single block under this session.
    pub async fn get_block(&self, cancel: &CancellationToken, id: BlockId) -> Result<Block> {
        let rx = self.get_blocks(cancel, vec![id]).await?;
        Exchange::first_block(rx, cancel).await
    }

    /// Whether a fetch in this session is still waiting for `id`.
    pub fn interested_in(&self, id: &BlockId) -> bool {
        self.shared.interested_in(id)
    }

    /// Peers that delivered blocks to this session, in first-delivery order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers()
    }

    pub fn blocks_received(&self) -> u64 {
        self.shared.blocks_received()
    }

    /// End the session and every fetch running under it.
    pub fn cancel(&self) {
        self.shared.token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        !self.shared.is_live()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id())
            .field("blocks_received", &self.shared.blocks_received())
            .finish()
    }
}
