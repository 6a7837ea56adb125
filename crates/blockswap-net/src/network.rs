//! Network abstraction consumed by the exchange.
//!
//! Implementations move [`BlockMessage`]s between peers, discover which peers
//! provide a block, and announce the blocks this node can provide.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blockswap_core::{BlockId, PeerId};

use crate::error::Result;
use crate::messages::BlockMessage;

/// Something that happened on the network.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer sent us a message.
    Message { from: PeerId, message: BlockMessage },
    /// A connection to a peer was established.
    PeerConnected(PeerId),
    /// A connection to a peer was lost.
    PeerDisconnected(PeerId),
}

/// Network trait for exchanging blocks with peers.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Network: Send + Sync {
    /// The local node's identity.
    fn local_peer(&self) -> PeerId;

    /// Send a message to a peer, dialing it first if necessary.
    async fn send_message(&self, peer: &PeerId, message: BlockMessage) -> Result<()>;

    /// Receive the next inbound event.
    ///
    /// Returns `NetError::Closed` once the endpoint has shut down.
    async fn recv(&self) -> Result<NetworkEvent>;

    /// Establish a connection to a peer.
    async fn connect_to(&self, peer: &PeerId) -> Result<()>;

    /// Look up peers providing `id`.
    ///
    /// Yields at most `max` peers. The stream closes when the search is
    /// exhausted or `cancel` fires.
    fn find_providers(
        &self,
        id: BlockId,
        max: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PeerId>;

    /// Announce that this node can provide `id`.
    async fn provide(&self, id: &BlockId) -> Result<()>;

    /// Peers we currently hold a connection to.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Feed of identifiers other peers announce, for nodes that keep a copy
    /// of what the network provides.
    ///
    /// `None` when the transport has no such feed.
    fn subscribe_announcements(&self) -> Option<mpsc::Receiver<BlockId>> {
        None
    }
}
