//! Error types for Blockswap Core.

use thiserror::Error;

use crate::types::BlockId;

/// Errors raised while constructing or checking core primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("block content does not match its identifier: expected {expected}, got {actual}")]
    InvalidBlock { expected: BlockId, actual: BlockId },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid public key")]
    InvalidPublicKey,
}

pub type Result<T> = std::result::Result<T, CoreError>;
