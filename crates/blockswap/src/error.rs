//! Error types for the exchange.

use thiserror::Error;

use blockswap_net::NetError;
use blockswap_store::StoreError;

/// Errors surfaced to callers of the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The exchange has been closed.
    #[error("exchange is closed")]
    Closed,

    /// The caller's request was cancelled or timed out before completing.
    #[error("request cancelled")]
    Cancelled,

    /// Local storage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A network operation failed.
    #[error("network error: {0}")]
    Network(#[from] NetError),

    /// A background worker panicked and took the exchange down.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
