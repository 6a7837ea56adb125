//! Wire message exchanged between peers.
//!
//! A single message type carries both halves of the protocol: want-list
//! updates (new wants and cancels) and blocks being delivered. Messages are
//! encoded as CBOR.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use blockswap_core::{Block, BlockId, WantEntry};

use crate::error::{NetError, Result};

/// Protocol identifier negotiated on streams.
pub const PROTOCOL_ID: &str = "/blockswap/1.0.0";

/// Message size limits.
pub mod limits {
    /// Max entries in a want-list update.
    pub const MAX_WANTLIST_ENTRIES: usize = 8192;
    /// Max blocks carried by one message.
    pub const MAX_BLOCKS_PER_MESSAGE: usize = 256;
    /// Max encoded message size in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
}

/// One want-list delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantlistEntry {
    pub id: BlockId,
    pub priority: i32,
    /// True if the sender no longer wants this block.
    pub cancel: bool,
}

/// A protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    wantlist: Vec<WantlistEntry>,
    /// When set, the want-list replaces everything the receiver knew about
    /// the sender's wants.
    full: bool,
    blocks: Vec<Block>,
}

impl BlockMessage {
    /// An empty incremental message.
    pub fn new() -> Self {
        Self::default()
    }

    /// A message carrying the sender's complete want-list.
    pub fn full_wantlist(entries: impl IntoIterator<Item = WantEntry>) -> Self {
        let mut msg = Self {
            full: true,
            ..Self::default()
        };
        msg.extend(entries.into_iter().map(|entry| WantlistEntry {
            id: entry.id,
            priority: entry.priority,
            cancel: false,
        }));
        msg
    }

    /// A message delivering blocks.
    pub fn with_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        let mut msg = Self::new();
        for block in blocks {
            msg.add_block(block);
        }
        msg
    }

    /// Want `id`. Replaces any earlier entry for the same block.
    pub fn add_entry(&mut self, id: BlockId, priority: i32) {
        self.upsert(WantlistEntry {
            id,
            priority,
            cancel: false,
        });
    }

    /// Retract a want for `id`.
    pub fn cancel(&mut self, id: BlockId) {
        self.upsert(WantlistEntry {
            id,
            priority: 0,
            cancel: true,
        });
    }

    fn upsert(&mut self, entry: WantlistEntry) {
        match self.wantlist.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.wantlist.push(entry),
        }
    }

    /// Apply many deltas at once. A later entry for the same block replaces
    /// an earlier one.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = WantlistEntry>) {
        let mut index: HashMap<BlockId, usize> = self
            .wantlist
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        for entry in entries {
            match index.get(&entry.id) {
                Some(&i) => self.wantlist[i] = entry,
                None => {
                    index.insert(entry.id, self.wantlist.len());
                    self.wantlist.push(entry);
                }
            }
        }
    }

    /// Attach a block. A block already attached is not added twice.
    pub fn add_block(&mut self, block: Block) {
        if !self.blocks.iter().any(|b| b.id() == block.id()) {
            self.blocks.push(block);
        }
    }

    /// Fold a later message into this one.
    ///
    /// A full want-list in `later` supersedes everything queued before it.
    pub fn merge(&mut self, later: BlockMessage) {
        if later.full {
            self.wantlist.clear();
            self.full = true;
        }
        self.extend(later.wantlist);
        for block in later.blocks {
            self.add_block(block);
        }
    }

    pub fn wantlist(&self) -> &[WantlistEntry] {
        &self.wantlist
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Total payload bytes of attached blocks.
    pub fn block_bytes(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// True if the message carries nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty() && !self.full
    }

    /// Break this message into parts that each respect the entry and block
    /// limits.
    ///
    /// Only the first part keeps the full flag, so a receiver resets once
    /// and applies the later parts as additions.
    pub fn split(self) -> Vec<BlockMessage> {
        let Self {
            wantlist,
            full,
            blocks,
        } = self;
        if wantlist.len() <= limits::MAX_WANTLIST_ENTRIES
            && blocks.len() <= limits::MAX_BLOCKS_PER_MESSAGE
        {
            return vec![Self {
                wantlist,
                full,
                blocks,
            }];
        }

        let mut wants = wantlist.chunks(limits::MAX_WANTLIST_ENTRIES);
        let mut attached = blocks.chunks(limits::MAX_BLOCKS_PER_MESSAGE);
        let mut parts = Vec::new();
        loop {
            let (w, b) = (wants.next(), attached.next());
            if w.is_none() && b.is_none() {
                break;
            }
            parts.push(Self {
                wantlist: w.map(<[_]>::to_vec).unwrap_or_default(),
                full: full && parts.is_empty(),
                blocks: b.map(<[_]>::to_vec).unwrap_or_default(),
            });
        }
        parts
    }

    /// Check that this message respects size limits.
    pub fn validate_limits(&self) -> Result<()> {
        if self.wantlist.len() > limits::MAX_WANTLIST_ENTRIES {
            return Err(NetError::InvalidMessage("too many want-list entries"));
        }
        if self.blocks.len() > limits::MAX_BLOCKS_PER_MESSAGE {
            return Err(NetError::InvalidMessage("too many blocks"));
        }
        Ok(())
    }

    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate_limits()?;
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| NetError::Encoding(e.to_string()))?;
        if buf.len() > limits::MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                size: buf.len(),
                max: limits::MAX_MESSAGE_SIZE,
            });
        }
        Ok(buf)
    }

    /// Decode from CBOR, checking limits and block integrity.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > limits::MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                size: bytes.len(),
                max: limits::MAX_MESSAGE_SIZE,
            });
        }
        let msg: Self =
            ciborium::from_reader(bytes).map_err(|e| NetError::Decoding(e.to_string()))?;
        msg.validate_limits()?;
        for block in &msg.blocks {
            block.verify()?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cancel_replaces_want() {
        let id = BlockId::for_data(b"x");
        let mut msg = BlockMessage::new();
        msg.add_entry(id, 10);
        msg.cancel(id);
        assert_eq!(msg.wantlist().len(), 1);
        assert!(msg.wantlist()[0].cancel);
    }

    #[test]
    fn test_merge_later_cancel_wins() {
        let id = BlockId::for_data(b"m");
        let mut first = BlockMessage::new();
        first.add_entry(id, 5);
        let mut second = BlockMessage::new();
        second.cancel(id);

        first.merge(second);
        assert_eq!(first.wantlist().len(), 1);
        assert!(first.wantlist()[0].cancel);
    }

    #[test]
    fn test_merge_full_resets_earlier_entries() {
        let old = BlockId::for_data(b"old");
        let new = BlockId::for_data(b"new");
        let mut queued = BlockMessage::new();
        queued.cancel(old);

        queued.merge(BlockMessage::full_wantlist(vec![WantEntry { id: new, priority: 1 }]));
        assert!(queued.is_full());
        let ids: Vec<BlockId> = queued.wantlist().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![new]);
    }

    #[test]
    fn test_duplicate_block_not_attached_twice() {
        let block = Block::new(&b"b"[..]);
        let msg = BlockMessage::with_blocks(vec![block.clone(), block]);
        assert_eq!(msg.blocks().len(), 1);
        assert_eq!(msg.block_bytes(), 1);
    }

    #[test]
    fn test_empty_full_wantlist_is_not_empty() {
        assert!(BlockMessage::new().is_empty());
        assert!(!BlockMessage::full_wantlist(Vec::new()).is_empty());
    }

    #[test]
    fn test_decode_rejects_tampered_block() {
        let forged = Block::with_id(BlockId::for_data(b"claimed"), &b"actual"[..]);
        let msg = BlockMessage {
            blocks: vec![forged],
            ..BlockMessage::default()
        };
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            BlockMessage::from_bytes(&bytes),
            Err(NetError::Core(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            BlockMessage::from_bytes(&[0xff, 0x00, 0x13]),
            Err(NetError::Decoding(_))
        ));
    }

    #[test]
    fn test_too_many_blocks_rejected() {
        let msg = BlockMessage {
            blocks: (0..=limits::MAX_BLOCKS_PER_MESSAGE)
                .map(|i| Block::new((i as u32).to_be_bytes().to_vec()))
                .collect(),
            ..BlockMessage::default()
        };
        assert!(matches!(msg.to_bytes(), Err(NetError::InvalidMessage(_))));
    }

    fn distinct_ids(n: usize) -> Vec<BlockId> {
        (0..n as u32)
            .map(|i| BlockId::for_data(&i.to_be_bytes()))
            .collect()
    }

    #[test]
    fn test_small_message_split_is_unchanged() {
        let mut msg = BlockMessage::full_wantlist(Vec::new());
        msg.add_entry(BlockId::for_data(b"a"), 3);
        assert_eq!(msg.clone().split(), vec![msg]);
    }

    #[test]
    fn test_oversized_wantlist_splits_within_limits() {
        let ids = distinct_ids(limits::MAX_WANTLIST_ENTRIES * 2 + 5);
        let msg = BlockMessage::full_wantlist(
            ids.iter().map(|id| WantEntry { id: *id, priority: 1 }),
        );
        assert!(msg.to_bytes().is_err());

        let parts = msg.split();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].is_full());
        assert!(parts[1..].iter().all(|p| !p.is_full()));
        for part in &parts {
            part.to_bytes().unwrap();
        }
        let rejoined: Vec<BlockId> = parts
            .iter()
            .flat_map(|p| p.wantlist().iter().map(|e| e.id))
            .collect();
        assert_eq!(rejoined, ids);
    }

    #[test]
    fn test_extend_replaces_earlier_entries() {
        let id = BlockId::for_data(b"e");
        let mut msg = BlockMessage::new();
        msg.add_entry(id, 9);
        msg.extend([
            WantlistEntry {
                id,
                priority: 0,
                cancel: true,
            },
            WantlistEntry {
                id: BlockId::for_data(b"f"),
                priority: 2,
                cancel: false,
            },
        ]);
        assert_eq!(msg.wantlist().len(), 2);
        assert!(msg.wantlist()[0].cancel);
    }

    proptest! {
        #[test]
        fn prop_codec_preserves_message(
            wants in proptest::collection::vec(
                (any::<[u8; 32]>(), any::<i32>(), any::<bool>()),
                0..20,
            ),
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..128),
                0..8,
            ),
            full in any::<bool>(),
        ) {
            let mut msg = if full {
                BlockMessage::full_wantlist(Vec::new())
            } else {
                BlockMessage::new()
            };
            for (bytes, priority, cancel) in wants {
                let id = BlockId::from_bytes(bytes);
                if cancel { msg.cancel(id) } else { msg.add_entry(id, priority) }
            }
            for p in payloads {
                msg.add_block(Block::new(p));
            }
            let decoded = BlockMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
