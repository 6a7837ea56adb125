//! # Blockswap Net
//!
//! The wire message and the network seam the exchange talks through.
//!
//! ## Key Types
//!
//! - [`BlockMessage`] - Want-list deltas plus delivered blocks, CBOR on the wire
//! - [`Network`] - Async trait: send, receive, connect, find providers, provide
//! - [`NetworkEvent`] - Inbound messages and connection changes
//! - [`MemoryNetwork`] / [`MemoryAdapter`] - In-process network for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blockswap_core::{Block, PeerId};
//! use blockswap_net::{BlockMessage, MemoryNetwork, Network};
//!
//! async fn example() -> blockswap_net::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let a = network.adapter(PeerId::random()).await;
//!     let b = network.adapter(PeerId::random()).await;
//!
//!     let msg = BlockMessage::with_blocks(vec![Block::new(&b"hi"[..])]);
//!     a.send_message(&b.local_peer(), msg).await?;
//!     let _event = b.recv().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod messages;
pub mod network;

pub use error::{NetError, Result};
pub use memory::{MemoryAdapter, MemoryNetwork, MemoryNetworkConfig, SearchStats};
pub use messages::{limits, BlockMessage, WantlistEntry, PROTOCOL_ID};
pub use network::{Network, NetworkEvent};
