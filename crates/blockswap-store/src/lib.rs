//! # Blockswap Store
//!
//! Storage abstraction for content-addressed blocks. Provides a trait-based
//! interface with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The exchange never touches storage directly; it goes through the
//! [`BlockStore`] trait. The persistent implementation is
//! [`SqliteBlockStore`], with [`MemoryBlockStore`] for tests and ephemeral
//! nodes.
//!
//! ## Key Types
//!
//! - [`BlockStore`] - The async trait for all storage operations
//! - [`SqliteBlockStore`] - SQLite-based persistent storage
//! - [`MemoryBlockStore`] - In-memory storage for tests
//! - [`PutResult`] - Result of storing a block
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blockswap_core::Block;
//! use blockswap_store::{BlockStore, PutResult, SqliteBlockStore};
//!
//! async fn example() -> blockswap_store::Result<()> {
//!     let store = SqliteBlockStore::open("blocks.db")?;
//!
//!     let block = Block::new(&b"hello"[..]);
//!     assert_eq!(store.put(&block).await?, PutResult::Inserted);
//!     assert_eq!(store.put(&block).await?, PutResult::AlreadyExists);
//!     assert!(store.has(&block.id()).await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent puts**: Storing the same block twice returns `AlreadyExists`
//! - **Integrity on write**: Blocks whose payload does not hash to their id are rejected
//! - **Concurrent access**: Every implementation is safe for concurrent put/get/has

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryBlockStore;
pub use sqlite::SqliteBlockStore;
pub use traits::{BlockStore, PutResult};
