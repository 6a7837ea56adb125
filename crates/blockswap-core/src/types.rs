//! Strong identifier types for Blockswap.
//!
//! Block identifiers and peer identifiers are both 32-byte digests. They are
//! kept as distinct newtypes so a peer can never be used where a block is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 32] = slice.try_into()?;
                Ok(Self(arr))
            }
        }
    };
}

digest_newtype!(
    /// Content address of a block: Blake3 of the block payload.
    ///
    /// Two blocks with the same payload have the same BlockId.
    BlockId
);

digest_newtype!(
    /// Identity of a peer on the network: Blake3 of its Ed25519 public key.
    PeerId
);

impl BlockId {
    /// Compute the identifier for a payload.
    pub fn for_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl PeerId {
    /// A random peer identifier, not backed by a keypair.
    ///
    /// Useful for tests that only need distinct peers.
    pub fn random() -> Self {
        Self(rand::random())
    }
}
