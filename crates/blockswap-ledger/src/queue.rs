//! Fair per-peer queue of blocks to serve.
//!
//! Peers are served round-robin; within a peer, higher priority first and
//! then first-come.

use std::collections::{HashMap, VecDeque};

use blockswap_core::{BlockId, PeerId};

/// One block owed to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub id: BlockId,
    pub priority: i32,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct PeerRequestQueue {
    tasks: HashMap<PeerId, Vec<Task>>,
    order: VecDeque<PeerId>,
    next_seq: u64,
}

impl PeerRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` for `peer`. A block already queued for the peer keeps its
    /// place and takes the higher of the two priorities.
    ///
    /// Returns true if a new task was queued.
    pub fn push(&mut self, peer: PeerId, id: BlockId, priority: i32) -> bool {
        if !self.tasks.contains_key(&peer) {
            self.order.push_back(peer);
            self.tasks.insert(peer, Vec::new());
        }
        let Some(tasks) = self.tasks.get_mut(&peer) else {
            return false;
        };
        if let Some(existing) = tasks.iter_mut().find(|t| t.id == id) {
            existing.priority = existing.priority.max(priority);
            return false;
        }
        tasks.push(Task {
            id,
            priority,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    /// Drop a queued block for `peer`.
    pub fn remove(&mut self, peer: &PeerId, id: &BlockId) {
        let now_empty = match self.tasks.get_mut(peer) {
            Some(tasks) => {
                tasks.retain(|t| t.id != *id);
                tasks.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.remove_peer(peer);
        }
    }

    /// Drop everything queued for `peer`.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if self.tasks.remove(peer).is_some() {
            self.order.retain(|p| p != peer);
        }
    }

    /// Take up to `max` tasks for the next peer in line.
    pub fn pop_batch(&mut self, max: usize) -> Option<(PeerId, Vec<Task>)> {
        let peer = self.order.pop_front()?;
        let mut tasks = self.tasks.remove(&peer)?;
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let rest = tasks.split_off(max.max(1).min(tasks.len()));
        if !rest.is_empty() {
            self.tasks.insert(peer, rest);
            self.order.push_back(peer);
        }
        Some((peer, tasks))
    }

    /// Number of queued tasks across all peers.
    pub fn len(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn id(n: u8) -> BlockId {
        BlockId::from_bytes([n; 32])
    }

    #[test]
    fn test_priority_then_arrival() {
        let mut q = PeerRequestQueue::new();
        q.push(peer(1), id(1), 1);
        q.push(peer(1), id(2), 5);
        q.push(peer(1), id(3), 1);

        let (p, tasks) = q.pop_batch(10).unwrap();
        assert_eq!(p, peer(1));
        let ids: Vec<BlockId> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![id(2), id(1), id(3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_round_robin_between_peers() {
        let mut q = PeerRequestQueue::new();
        for n in 0..3 {
            q.push(peer(1), id(n), 1);
        }
        q.push(peer(2), id(10), 1);

        let served: Vec<PeerId> = std::iter::from_fn(|| q.pop_batch(1).map(|(p, _)| p)).collect();
        assert_eq!(served, vec![peer(1), peer(2), peer(1), peer(1)]);
    }

    #[test]
    fn test_duplicate_push_coalesces() {
        let mut q = PeerRequestQueue::new();
        assert!(q.push(peer(1), id(1), 1));
        assert!(!q.push(peer(1), id(1), 9));
        assert_eq!(q.len(), 1);
        let (_, tasks) = q.pop_batch(1).unwrap();
        assert_eq!(tasks[0].priority, 9);
    }

    #[test]
    fn test_remove_last_task_drops_peer() {
        let mut q = PeerRequestQueue::new();
        q.push(peer(1), id(1), 1);
        q.push(peer(2), id(2), 1);
        q.remove(&peer(1), &id(1));

        let (p, _) = q.pop_batch(1).unwrap();
        assert_eq!(p, peer(2));
        assert!(q.pop_batch(1).is_none());
    }
}
