//! Per-peer accounting.

use std::time::Instant;

use blockswap_core::{BlockId, PeerId, WantEntry, Wantlist};

/// Snapshot of what we have exchanged with one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReceipt {
    pub peer: PeerId,
    /// Debt ratio: bytes sent per byte received.
    pub value: f64,
    pub sent: u64,
    pub recv: u64,
    /// Blocks exchanged in either direction.
    pub exchanged: u64,
}

/// Our record of one partner.
#[derive(Debug)]
pub struct PeerLedger {
    partner: PeerId,
    bytes_sent: u64,
    bytes_recv: u64,
    exchanged: u64,
    first_exchange: Option<Instant>,
    last_exchange: Option<Instant>,
    wantlist: Wantlist,
    /// Open connections to this partner.
    pub(crate) refs: usize,
}

impl PeerLedger {
    pub fn new(partner: PeerId) -> Self {
        Self {
            partner,
            bytes_sent: 0,
            bytes_recv: 0,
            exchanged: 0,
            first_exchange: None,
            last_exchange: None,
            wantlist: Wantlist::new(),
            refs: 0,
        }
    }

    pub fn partner(&self) -> PeerId {
        self.partner
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.first_exchange.get_or_insert(now);
        self.last_exchange = Some(now);
        self.exchanged += 1;
    }

    pub fn sent_bytes(&mut self, n: usize) {
        self.bytes_sent += n as u64;
        self.touch();
    }

    pub fn received_bytes(&mut self, n: usize) {
        self.bytes_recv += n as u64;
        self.touch();
    }

    pub fn wants(&mut self, id: BlockId, priority: i32) {
        self.wantlist.add(id, priority);
    }

    pub fn cancel_want(&mut self, id: &BlockId) -> bool {
        self.wantlist.remove(id)
    }

    pub fn clear_wants(&mut self) {
        self.wantlist.clear();
    }

    /// Priority of `id` if the partner wants it.
    pub fn wants_block(&self, id: &BlockId) -> Option<i32> {
        self.wantlist.priority(id)
    }

    pub fn wantlist(&self) -> Vec<WantEntry> {
        self.wantlist.entries()
    }

    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv as f64 + 1.0)
    }

    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    pub fn receipt(&self) -> LedgerReceipt {
        LedgerReceipt {
            peer: self.partner,
            value: self.debt_ratio(),
            sent: self.bytes_sent,
            recv: self.bytes_recv,
            exchanged: self.exchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debt_ratio() {
        let mut ledger = PeerLedger::new(PeerId::from_bytes([1; 32]));
        assert_eq!(ledger.debt_ratio(), 0.0);

        ledger.sent_bytes(100);
        ledger.received_bytes(49);
        assert_eq!(ledger.debt_ratio(), 2.0);

        let receipt = ledger.receipt();
        assert_eq!(receipt.sent, 100);
        assert_eq!(receipt.recv, 49);
        assert_eq!(receipt.exchanged, 2);
        assert!(ledger.last_exchange().is_some());
    }

    #[test]
    fn test_wants() {
        let mut ledger = PeerLedger::new(PeerId::from_bytes([1; 32]));
        let id = BlockId::for_data(b"w");
        ledger.wants(id, 3);
        assert_eq!(ledger.wants_block(&id), Some(3));
        assert!(ledger.cancel_want(&id));
        assert_eq!(ledger.wants_block(&id), None);
    }
}
