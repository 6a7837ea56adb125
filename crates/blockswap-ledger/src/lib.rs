//! # Blockswap Ledger
//!
//! Decides which blocks to send to which peer, and keeps the books.
//!
//! ## Overview
//!
//! The exchange drives a [`Ledger`] with everything it sees: inbound
//! messages (want-lists and received blocks), outbound messages, blocks that
//! became available locally, and connection changes. The ledger answers with
//! [`Envelope`]s on its [`Outbox`], which the exchange's task workers send.
//!
//! [`Engine`] is the reference implementation: per-peer byte accounting and a
//! round-robin queue that serves each peer's highest-priority wants first.
//!
//! ## Key Types
//!
//! - [`Ledger`] - The trait the exchange consumes
//! - [`Outbox`] / [`Envelope`] - Ready-to-send work
//! - [`Engine`] - Reference implementation
//! - [`LedgerReceipt`] - Accounting snapshot for one peer

pub mod engine;
pub mod ledger;
pub mod queue;
pub mod traits;

pub use engine::{Engine, EngineConfig};
pub use ledger::{LedgerReceipt, PeerLedger};
pub use queue::{PeerRequestQueue, Task};
pub use traits::{Envelope, EnvelopeSlot, Ledger, Outbox};
