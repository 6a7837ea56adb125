//! # Blockswap Core
//!
//! Pure primitives for Blockswap: content-addressed blocks, peer identities,
//! and want-lists.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Block`] - An immutable payload plus its content address
//! - [`BlockId`] - Blake3 digest of a block payload
//! - [`PeerId`] - Blake3 digest of a node's Ed25519 public key
//! - [`Identity`] - The keypair behind a [`PeerId`]
//! - [`SessionTrackedWantlist`] - The local want-list, reference-counted by session
//! - [`Wantlist`] - A remote peer's want-list

pub mod block;
pub mod error;
pub mod identity;
pub mod types;
pub mod wantlist;

pub use block::Block;
pub use error::{CoreError, Result};
pub use identity::{peer_id_for_key, Identity};
pub use types::{BlockId, PeerId};
pub use wantlist::{SessionId, SessionTrackedWantlist, WantEntry, Wantlist, MAX_PRIORITY};
