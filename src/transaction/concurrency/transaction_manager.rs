use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Error, Debug)]
pub enum TransactionManagerError {
    #[error("Transaction {0} not found")]
    NotFound(TxnId),
}

/// Transaction manager - creates and tracks transactions.
///
/// Transaction ids increase monotonically, which is what makes the deadlock
/// detector's youngest-wins victim choice meaningful.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction in the GROWING state
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions
            .lock()
            .insert(txn_id, txn.clone());
        txn
    }

    /// Get a transaction by ID
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: any locks the transaction still holds are released
    pub fn commit(
        &self,
        txn_id: TxnId,
        lock_manager: &LockManager,
    ) -> Result<(), TransactionManagerError> {
        let txn = self
            .active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionManagerError::NotFound(txn_id))?;

        txn.set_state(TransactionState::Committed);
        lock_manager.release_all_locks(&txn);
        Ok(())
    }

    /// Abort: releases the transaction's remaining locks. Also the way a
    /// caller finalizes a transaction the deadlock detector killed.
    pub fn abort(
        &self,
        txn_id: TxnId,
        lock_manager: &LockManager,
    ) -> Result<(), TransactionManagerError> {
        let txn = self
            .active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionManagerError::NotFound(txn_id))?;

        txn.set_state(TransactionState::Aborted);
        lock_manager.release_all_locks(&txn);
        Ok(())
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
