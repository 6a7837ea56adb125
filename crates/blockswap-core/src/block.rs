//! Content-addressed blocks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::BlockId;

/// An immutable chunk of data together with its content address.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    id: BlockId,
    data: Bytes,
}

impl Block {
    /// Create a block, computing its identifier from the payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = BlockId::for_data(&data);
        Self { id, data }
    }

    /// Create a block with a caller-supplied identifier.
    ///
    /// No hashing is done. Use [`Block::verify`] before trusting a block built
    /// this way.
    pub fn with_id(id: BlockId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that the payload hashes to the identifier.
    pub fn verify(&self) -> Result<()> {
        let actual = BlockId::for_data(&self.data);
        if actual != self.id {
            return Err(CoreError::InvalidBlock {
                expected: self.id,
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}
