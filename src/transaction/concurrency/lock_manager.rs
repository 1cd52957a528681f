// Multi-granularity two-phase lock manager. Tables lock in five modes, rows
// in S/X only; per-object FIFO queues grant by compatibility, and a
// background thread resolves deadlocks by aborting the youngest transaction
// on each cycle.
//
// Latch order, to keep the latches themselves deadlock-free:
//   waits_for -> table_lock_map -> queue.state
//   waits_for -> row_lock_map   -> queue.state
// Page latches are never held across calls into this module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::deadlock::WaitsForGraph;
use crate::transaction::concurrency::request_queue::{
    LockRequest, LockRequestQueue, LockTarget, QueueState,
};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, LockMode, Transaction, TransactionAbortError, TransactionState,
};
use crate::transaction::concurrency::transaction_manager::TransactionManager;

/// Read-only view of a queue for diagnostics
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub requests: Vec<(TxnId, LockMode, bool)>,
    pub upgrading: Option<TxnId>,
}

pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    waits_for: Mutex<WaitsForGraph>,
    txn_manager: Arc<TransactionManager>,
    detector_running: AtomicBool,
    detector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(WaitsForGraph::new()),
            txn_manager,
            detector_running: AtomicBool::new(false),
            detector_handle: Mutex::new(None),
        }
    }

    /// Acquire a table lock, blocking until granted or the transaction is
    /// aborted out from under the wait.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionAbortError> {
        self.assert_not_finished(txn);
        self.check_table_lock_allowed(txn, mode)?;

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        // Re-locking with a different mode is an upgrade
        if let Some(existing) = state.granted_request(txn.id()).cloned() {
            if existing.mode == mode {
                return Ok(());
            }
            if state.upgrading.is_some() {
                return Err(txn.abort_with(AbortReason::UpgradeConflict));
            }
            if !existing.mode.upgradable_to(mode) {
                return Err(txn.abort_with(AbortReason::IncompatibleUpgrade));
            }
            state.remove_request(txn.id(), true);
            txn.erase_table_lock(existing.mode, oid);
            state.upgrading = Some(txn.id());
            debug!("txn {} upgrading table {} to {:?}", txn.id(), oid, mode);
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            target: LockTarget::Table(oid),
            granted: false,
        });

        while !state.try_grant(txn, mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                // Killed by the deadlock detector while waiting
                state.remove_request(txn.id(), false);
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                return Err(TransactionAbortError {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }
        Ok(())
    }

    /// Release a table lock. Every row lock on the table must already be
    /// gone.
    pub fn unlock_table(
        &self,
        txn: &Transaction,
        oid: TableOid,
    ) -> Result<(), TransactionAbortError> {
        if txn.holds_row_locks_on(oid) {
            return Err(txn.abort_with(AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let Some(queue) = self.existing_table_queue(oid) else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();

        let Some(request) = state.granted_request(txn.id()).cloned() else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };

        self.maybe_shrink_on_table_unlock(txn, request.mode);
        txn.erase_table_lock(request.mode, oid);
        state.remove_request(txn.id(), true);

        drop(state);
        queue.cv.notify_all();
        Ok(())
    }

    /// Acquire a row lock (S or X). The enclosing table must already be
    /// locked appropriately.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbortError> {
        if mode.is_intention() {
            return Err(txn.abort_with(AbortReason::AttemptedIntentionLockOnRow));
        }
        self.assert_not_finished(txn);
        self.check_row_lock_allowed(txn, mode)?;

        let table_ok = if mode == LockMode::Shared {
            txn.holds_any_table_lock(oid)
        } else {
            txn.holds_write_table_lock(oid)
        };
        if !table_ok {
            return Err(txn.abort_with(AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        if let Some(existing) = state.granted_request(txn.id()).cloned() {
            if existing.mode == mode {
                return Ok(());
            }
            if state.upgrading.is_some() {
                return Err(txn.abort_with(AbortReason::UpgradeConflict));
            }
            // Rows only upgrade S -> X
            if !(existing.mode == LockMode::Shared && mode == LockMode::Exclusive) {
                return Err(txn.abort_with(AbortReason::IncompatibleUpgrade));
            }
            state.remove_request(txn.id(), true);
            if let LockTarget::Row(prev_oid, prev_rid) = existing.target {
                txn.erase_row_lock(existing.mode, prev_oid, prev_rid);
            }
            state.upgrading = Some(txn.id());
            debug!("txn {} upgrading row {:?} to {:?}", txn.id(), rid, mode);
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            target: LockTarget::Row(oid, rid),
            granted: false,
        });

        while !state.try_grant(txn, mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                state.remove_request(txn.id(), false);
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                return Err(TransactionAbortError {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }
        Ok(())
    }

    /// Release a row lock
    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbortError> {
        let Some(queue) = self.existing_row_queue(rid) else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();

        let Some(request) = state.granted_request(txn.id()).cloned() else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };

        self.maybe_shrink_on_row_unlock(txn, request.mode);
        txn.erase_row_lock(request.mode, oid, rid);
        state.remove_request(txn.id(), true);

        drop(state);
        queue.cv.notify_all();
        Ok(())
    }

    /// Release everything a transaction still holds, rows before tables.
    /// Used by commit/abort cleanup and for deadlock victims.
    pub fn release_all_locks(&self, txn: &Transaction) {
        let (rows, tables) = {
            let sets = txn.lock_sets().lock();
            let mut rows: Vec<(TableOid, Rid)> = Vec::new();
            for (&oid, rids) in sets.shared_rows.iter().chain(sets.exclusive_rows.iter()) {
                rows.extend(rids.iter().map(|&rid| (oid, rid)));
            }
            let mut tables: Vec<TableOid> = Vec::new();
            tables.extend(sets.shared_tables.iter().copied());
            tables.extend(sets.exclusive_tables.iter().copied());
            tables.extend(sets.intention_shared_tables.iter().copied());
            tables.extend(sets.intention_exclusive_tables.iter().copied());
            tables.extend(sets.shared_intention_exclusive_tables.iter().copied());
            (rows, tables)
        };

        for (oid, rid) in rows {
            let _ = self.unlock_row(txn, oid, rid);
        }
        for oid in tables {
            let _ = self.unlock_table(txn, oid);
        }
    }

    /// One deadlock detection pass: rebuild the waits-for graph from every
    /// queue, then abort the youngest transaction on each cycle until the
    /// graph is acyclic.
    pub fn detect_once(&self) {
        let mut graph = self.waits_for.lock();
        graph.clear();

        {
            let table_map = self.table_lock_map.lock();
            for queue in table_map.values() {
                let state = queue.state.lock();
                Self::add_queue_edges(&mut graph, &state);
            }
        }
        {
            let row_map = self.row_lock_map.lock();
            for queue in row_map.values() {
                let state = queue.state.lock();
                Self::add_queue_edges(&mut graph, &state);
            }
        }

        while let Some(victim) = graph.find_victim() {
            warn!("deadlock detected, aborting youngest transaction {}", victim);
            if let Some(txn) = self.txn_manager.get_transaction(victim) {
                txn.set_state(TransactionState::Aborted);
                // The victim's locks go away before its own wait returns
                self.release_all_locks(&txn);
            }
            graph.remove_txn(victim);
            self.notify_all_queues();
        }
    }

    /// Run `detect_once` on a dedicated thread every `interval`
    pub fn start_deadlock_detection(self: &Arc<Self>, interval: Duration) {
        if self.detector_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                let Some(manager) = weak.upgrade() else { break };
                if !manager.detector_running.load(Ordering::SeqCst) {
                    break;
                }
                manager.detect_once();
            })
            .expect("failed to spawn deadlock detector");
        *self.detector_handle.lock() = Some(handle);
    }

    pub fn stop_deadlock_detection(&self) {
        self.detector_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn table_queue_snapshot(&self, oid: TableOid) -> Option<QueueSnapshot> {
        let queue = self.existing_table_queue(oid)?;
        let state = queue.state.lock();
        Some(Self::snapshot(&state))
    }

    pub fn row_queue_snapshot(&self, rid: Rid) -> Option<QueueSnapshot> {
        let queue = self.existing_row_queue(rid)?;
        let state = queue.state.lock();
        Some(Self::snapshot(&state))
    }

    fn snapshot(state: &QueueState) -> QueueSnapshot {
        QueueSnapshot {
            requests: state
                .requests
                .iter()
                .map(|r| (r.txn_id, r.mode, r.granted))
                .collect(),
            upgrading: state.upgrading,
        }
    }

    fn add_queue_edges(graph: &mut WaitsForGraph, state: &QueueState) {
        for waiting in state.requests.iter().filter(|r| !r.granted) {
            for granted in state.requests.iter().filter(|r| r.granted) {
                if !waiting.mode.compatible_with(granted.mode) {
                    graph.add_edge(waiting.txn_id, granted.txn_id);
                }
            }
        }
    }

    fn notify_all_queues(&self) {
        let table_map = self.table_lock_map.lock();
        for queue in table_map.values() {
            queue.cv.notify_all();
        }
        drop(table_map);

        let row_map = self.row_lock_map.lock();
        for queue in row_map.values() {
            queue.cv.notify_all();
        }
    }

    fn assert_not_finished(&self, txn: &Transaction) {
        let state = txn.state();
        assert!(
            state != TransactionState::Committed && state != TransactionState::Aborted,
            "lock requested on finished transaction {}",
            txn.id()
        );
    }

    fn check_table_lock_allowed(
        &self,
        txn: &Transaction,
        mode: LockMode,
    ) -> Result<(), TransactionAbortError> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking
                    && !matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, LockMode::IntentionExclusive | LockMode::Exclusive) {
                    return Err(txn.abort_with(AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn check_row_lock_allowed(
        &self,
        txn: &Transaction,
        mode: LockMode,
    ) -> Result<(), TransactionAbortError> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking && mode != LockMode::Shared {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if mode != LockMode::Exclusive {
                    return Err(txn.abort_with(AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn maybe_shrink_on_table_unlock(&self, txn: &Transaction, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn maybe_shrink_on_row_unlock(&self, txn: &Transaction, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            // Row locks are always S or X
            IsolationLevel::RepeatableRead => true,
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_lock_map
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn existing_table_queue(&self, oid: TableOid) -> Option<Arc<LockRequestQueue>> {
        self.table_lock_map.lock().get(&oid).cloned()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        self.row_lock_map
            .lock()
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn existing_row_queue(&self, rid: Rid) -> Option<Arc<LockRequestQueue>> {
        self.row_lock_map.lock().get(&rid).cloned()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // The detector thread only holds a weak reference; telling it to stop
        // is enough, it exits on its next wake
        self.detector_running.store(false, Ordering::SeqCst);
    }
}
