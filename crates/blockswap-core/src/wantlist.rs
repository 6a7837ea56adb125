//! Want-lists: the set of blocks a node is asking for.
//!
//! [`Wantlist`] is the plain form, used to mirror what a remote peer wants.
//! [`SessionTrackedWantlist`] is the local form: each entry remembers which
//! sessions asked for it and only disappears once all of them have cancelled.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::types::BlockId;

/// Highest priority a want can carry.
pub const MAX_PRIORITY: i32 = i32::MAX;

/// Numeric session identifier. Session ids are allocated monotonically by the
/// exchange and never reused within a process.
pub type SessionId = u64;

/// A single want: which block, and how urgently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WantEntry {
    pub id: BlockId,
    pub priority: i32,
}

/// Sort highest priority first, ties broken by identifier so the order is stable.
fn sort_entries(entries: &mut [WantEntry]) {
    entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

/// A plain want-list keyed by block identifier.
#[derive(Clone, Debug, Default)]
pub struct Wantlist {
    entries: HashMap<BlockId, i32>,
}

impl Wantlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or re-prioritize an entry. Returns true if the entry is new.
    pub fn add(&mut self, id: BlockId, priority: i32) -> bool {
        self.entries.insert(id, priority).is_none()
    }

    /// Returns true if the entry was present.
    pub fn remove(&mut self, id: &BlockId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn priority(&self, id: &BlockId) -> Option<i32> {
        self.entries.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All entries, highest priority first.
    pub fn entries(&self) -> Vec<WantEntry> {
        let mut out: Vec<WantEntry> = self
            .entries
            .iter()
            .map(|(id, priority)| WantEntry {
                id: *id,
                priority: *priority,
            })
            .collect();
        sort_entries(&mut out);
        out
    }
}

#[derive(Clone, Debug)]
struct TrackedEntry {
    priority: i32,
    sessions: HashSet<SessionId>,
}

/// A want-list whose entries are reference-counted by session.
#[derive(Clone, Debug, Default)]
pub struct SessionTrackedWantlist {
    entries: HashMap<BlockId, TrackedEntry>,
}

impl SessionTrackedWantlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session` wants `id`.
    ///
    /// Returns true if the block was not wanted by any session before, which
    /// is when peers need to hear about it.
    pub fn add(&mut self, id: BlockId, priority: i32, session: SessionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.sessions.insert(session);
                false
            }
            None => {
                let mut sessions = HashSet::new();
                sessions.insert(session);
                self.entries.insert(id, TrackedEntry { priority, sessions });
                true
            }
        }
    }

    /// Drop `session`'s interest in `id`.
    ///
    /// Returns true if this removed the last interested session, which is
    /// when peers need to hear a cancel.
    pub fn remove(&mut self, id: &BlockId, session: SessionId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.sessions.remove(&session) {
            return false;
        }
        if entry.sessions.is_empty() {
            self.entries.remove(id);
            return true;
        }
        false
    }

    /// Remove an entry regardless of which sessions hold it.
    pub fn remove_all(&mut self, id: &BlockId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.entries.contains_key(id)
    }

    /// Sessions currently holding `id`.
    pub fn sessions(&self, id: &BlockId) -> Vec<SessionId> {
        self.entries
            .get(id)
            .map(|e| e.sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, highest priority first.
    pub fn entries(&self) -> Vec<WantEntry> {
        let mut out: Vec<WantEntry> = self
            .entries
            .iter()
            .map(|(id, e)| WantEntry {
                id: *id,
                priority: e.priority,
            })
            .collect();
        sort_entries(&mut out);
        out
    }
}
