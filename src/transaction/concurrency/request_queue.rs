// Per-object lock request queue: a FIFO of requests granted by mode
// compatibility, with a single upgrade slot that preempts the FIFO order.

use std::collections::VecDeque;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::transaction::{LockMode, Transaction};

/// What a request locks: a whole table, or one row of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    Table(TableOid),
    Row(TableOid, Rid),
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub target: LockTarget,
    pub granted: bool,
}

#[derive(Default)]
pub struct QueueState {
    pub requests: VecDeque<LockRequest>,
    /// At most one transaction may be upgrading per queue
    pub upgrading: Option<TxnId>,
}

impl QueueState {
    /// Attempt to grant the pending request of `txn`.
    ///
    /// A request is granted when its mode is compatible with every granted
    /// mode, and either the queue's upgrader is this transaction (upgrades
    /// preempt the FIFO) or no upgrade is pending and every earlier waiter of
    /// another transaction is compatible too, preserving FIFO fairness.
    ///
    /// On success the request's granted flag flips and the transaction's
    /// lock sets are updated.
    pub fn try_grant(&mut self, txn: &Transaction, mode: LockMode) -> bool {
        let granted_modes: Vec<LockMode> = self
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| r.mode)
            .collect();

        if !mode.compatible_with_all(&granted_modes) {
            return false;
        }

        if let Some(upgrader) = self.upgrading {
            if upgrader != txn.id() {
                // Someone else's upgrade goes first
                return false;
            }
            self.upgrading = None;
            return self.grant_request(txn, mode);
        }

        // Earlier ungranted requests of other transactions keep their place
        let mut wait_modes = Vec::new();
        for request in &self.requests {
            if request.txn_id == txn.id() {
                break;
            }
            if !request.granted {
                wait_modes.push(request.mode);
            }
        }
        if !mode.compatible_with_all(&wait_modes) {
            return false;
        }

        self.grant_request(txn, mode)
    }

    fn grant_request(&mut self, txn: &Transaction, mode: LockMode) -> bool {
        let Some(request) = self
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn.id() && !r.granted)
        else {
            return false;
        };
        request.granted = true;
        match request.target {
            LockTarget::Table(oid) => txn.record_table_lock(mode, oid),
            LockTarget::Row(oid, rid) => txn.record_row_lock(mode, oid, rid),
        }
        true
    }

    /// The granted request of `txn`, if any
    pub fn granted_request(&self, txn_id: TxnId) -> Option<&LockRequest> {
        self.requests.iter().find(|r| r.txn_id == txn_id && r.granted)
    }

    pub fn remove_request(&mut self, txn_id: TxnId, granted: bool) -> Option<LockRequest> {
        let pos = self
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id && r.granted == granted)?;
        self.requests.remove(pos)
    }
}

/// One queue per locked object, shared behind an Arc in the lock maps
pub struct LockRequestQueue {
    pub state: Mutex<QueueState>,
    pub cv: Condvar,
}

impl LockRequestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::concurrency::transaction::IsolationLevel;

    fn queue_with(requests: Vec<LockRequest>) -> QueueState {
        QueueState {
            requests: requests.into(),
            upgrading: None,
        }
    }

    fn request(txn_id: TxnId, mode: LockMode, granted: bool) -> LockRequest {
        LockRequest {
            txn_id,
            mode,
            target: LockTarget::Table(1),
            granted,
        }
    }

    #[test]
    fn test_grant_compatible_request() {
        let t2 = Transaction::new(2, IsolationLevel::RepeatableRead);
        let mut state = queue_with(vec![
            request(1, LockMode::Shared, true),
            request(2, LockMode::Shared, false),
        ]);
        assert!(state.try_grant(&t2, LockMode::Shared));
        assert!(state.granted_request(2).is_some());
        assert!(t2.holds_any_table_lock(1));
    }

    #[test]
    fn test_incompatible_request_waits() {
        let t2 = Transaction::new(2, IsolationLevel::RepeatableRead);
        let mut state = queue_with(vec![
            request(1, LockMode::Shared, true),
            request(2, LockMode::Exclusive, false),
        ]);
        assert!(!state.try_grant(&t2, LockMode::Exclusive));
        assert!(state.granted_request(2).is_none());
    }

    #[test]
    fn test_fifo_blocks_jumping_the_queue() {
        // T2 waits for X; T3's S is compatible with the granted set but must
        // not overtake T2
        let t3 = Transaction::new(3, IsolationLevel::RepeatableRead);
        let mut state = queue_with(vec![
            request(1, LockMode::Shared, true),
            request(2, LockMode::Exclusive, false),
            request(3, LockMode::Shared, false),
        ]);
        assert!(!state.try_grant(&t3, LockMode::Shared));
    }

    #[test]
    fn test_upgrader_preempts_fifo() {
        let t3 = Transaction::new(3, IsolationLevel::RepeatableRead);
        let mut state = queue_with(vec![
            request(2, LockMode::Exclusive, false),
            request(3, LockMode::Shared, false),
        ]);
        state.upgrading = Some(3);
        assert!(state.try_grant(&t3, LockMode::Shared));
        assert_eq!(state.upgrading, None);
    }

    #[test]
    fn test_waiting_upgrader_blocks_others() {
        let t2 = Transaction::new(2, IsolationLevel::RepeatableRead);
        let mut state = queue_with(vec![request(2, LockMode::Shared, false)]);
        state.upgrading = Some(9);
        assert!(!state.try_grant(&t2, LockMode::Shared));
        assert_eq!(state.upgrading, Some(9));
    }
}
