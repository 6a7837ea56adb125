//! # Blockswap Testkit
//!
//! Testing utilities for blockswap.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: [`InstanceGenerator`] builds exchanges on a shared
//!   in-memory network, optionally fully connected
//! - **Slow storage**: [`DelayedBlockStore`] adds latency to every store call
//! - **Generators**: deterministic block sequences and proptest strategies
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use blockswap_testkit::{BlockGenerator, InstanceGenerator};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let mut gen = InstanceGenerator::new();
//!     let nodes = gen.instances(2).await?;
//!     let block = BlockGenerator::new().next();
//!
//!     nodes[1].exchange.has_block(block.clone()).await?;
//!     let got = nodes[0]
//!         .exchange
//!         .get_block(&CancellationToken::new(), block.id())
//!         .await?;
//!     assert_eq!(got, block);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_config, DelayedBlockStore, Instance, InstanceGenerator};
pub use generators::{random_blocks, BlockGenerator};

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
