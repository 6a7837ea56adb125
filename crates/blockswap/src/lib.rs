//! # Blockswap
//!
//! A content-addressed block exchange: ask the network for blocks by
//! identifier, serve the blocks other peers want, and keep track of who
//! owes whom.
//!
//! ## Overview
//!
//! - **Want-lists**: every fetch registers its missing blocks with the
//!   [`WantManager`], which keeps connected peers informed
//! - **Sessions**: fetches run under a session that owns their want-list
//!   entries; cancelling a fetch retracts exactly what it asked for
//! - **Provider discovery**: if nothing arrives within the search delay,
//!   the exchange searches for and connects to providers, one search per
//!   block at a time
//! - **Serving**: a pool of task workers sends what the ledger decides to
//!   serve, while new local blocks are announced to the network
//! - **Replication** (opt-in): blocks other peers announce are fetched so
//!   this node keeps a copy
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use blockswap::net::MemoryNetwork;
//! use blockswap::store::MemoryBlockStore;
//! use blockswap::core::{BlockId, PeerId};
//! use blockswap::{with_timeout, Exchange, ExchangeConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(id: BlockId) -> blockswap::Result<()> {
//!     let net = MemoryNetwork::new();
//!     let adapter = net.adapter(PeerId::random()).await;
//!     let store = Arc::new(MemoryBlockStore::new());
//!     let exchange = Exchange::with_engine(ExchangeConfig::default(), Arc::new(adapter), store);
//!
//!     let cancel = with_timeout(&CancellationToken::new(), Duration::from_secs(5));
//!     let block = exchange.get_block(&cancel, id).await?;
//!     println!("got {} bytes", block.len());
//!
//!     exchange.close().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `blockswap::core` - Identifiers, blocks and want-lists
//! - `blockswap::store` - Block storage
//! - `blockswap::net` - Wire messages and the network seam
//! - `blockswap::ledger` - Serving decisions and accounting
//!
//! ## Design Notes
//!
//! - Shutdown is cooperative. Every worker selects on one cancellation
//!   token and [`Exchange::close`] waits for all of them. Dropping the last
//!   handle fires the same token without waiting.
//! - Want-list updates too large for one message go out in several parts.
//! - A panicking worker is fatal and surfaces from `close` as
//!   [`ExchangeError::WorkerPanicked`].
//! - Network failures are logged, never returned to fetch callers.

pub mod config;
pub mod context;
pub mod counters;
pub mod error;
pub mod exchange;
pub mod notifications;
pub mod session;
pub mod wantmanager;
mod workers;

pub use blockswap_core as core;
pub use blockswap_ledger as ledger;
pub use blockswap_net as net;
pub use blockswap_store as store;

pub use config::{ExchangeConfig, ProviderSearch};
pub use context::with_timeout;
pub use counters::{CounterSnapshot, Stat};
pub use error::{ExchangeError, Result};
pub use exchange::Exchange;
pub use notifications::{PubSub, Subscription};
pub use session::Session;
pub use wantmanager::WantManager;
pub use workers::BlockRequest;
