//! Error types for the network module.

use blockswap_core::{CoreError, PeerId};
use thiserror::Error;

/// Errors that can occur while encoding, decoding or moving messages.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    /// Message violates a protocol limit.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A received block does not match its identifier.
    #[error("invalid block: {0}")]
    Core(#[from] CoreError),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The network endpoint has shut down.
    #[error("network closed")]
    Closed,
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;
