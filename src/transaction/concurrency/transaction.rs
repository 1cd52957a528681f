// Transaction bookkeeping for two-phase locking: state machine, isolation
// level, and the per-transaction sets of granted locks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Growing => 0,
            TransactionState::Shrinking => 1,
            TransactionState::Committed => 2,
            TransactionState::Aborted => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Growing,
            1 => TransactionState::Shrinking,
            2 => TransactionState::Committed,
            3 => TransactionState::Aborted,
            _ => unreachable!("invalid transaction state"),
        }
    }
}

/// Multi-granularity lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }

    /// Multi-granularity compatibility matrix
    pub fn compatible_with_all(self, held: &[LockMode]) -> bool {
        held.iter().all(|&h| self.compatible_with(h))
    }

    pub fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => held != Exclusive,
            IntentionExclusive => matches!(held, IntentionShared | IntentionExclusive),
            Shared => matches!(held, IntentionShared | Shared),
            SharedIntentionExclusive => held == IntentionShared,
            Exclusive => false,
        }
    }

    /// Legal lock upgrades on the same object
    pub fn upgradable_to(self, target: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, target),
            (IntentionShared, Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive)
                | (Shared, Exclusive | SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }
}

/// Why a transaction was aborted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock acquired while shrinking")]
    LockOnShrinking,
    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this queue")]
    UpgradeConflict,
    #[error("requested upgrade is incompatible with the held lock")]
    IncompatibleUpgrade,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
    #[error("row lock requested without the required table lock")]
    TableLockNotPresent,
    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,
    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// The single abort signal surfaced to callers: which transaction died, and
/// why
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// Granted locks, grouped the way the lock manager consults them
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableOid>,
    pub exclusive_tables: HashSet<TableOid>,
    pub intention_shared_tables: HashSet<TableOid>,
    pub intention_exclusive_tables: HashSet<TableOid>,
    pub shared_intention_exclusive_tables: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// Transaction - a unit of two-phase locked work
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: AtomicU8,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: AtomicU8::new(TransactionState::Growing.as_u8()),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Abort with a typed reason and surface it to the caller
    pub fn abort_with(&self, reason: AbortReason) -> TransactionAbortError {
        self.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: self.id,
            reason,
        }
    }

    pub fn lock_sets(&self) -> &Mutex<LockSets> {
        &self.lock_sets
    }

    pub(crate) fn record_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn erase_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn record_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("intention modes are table-only"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn erase_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("intention modes are table-only"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// Any table lock at all on `oid` (prerequisite for row S locks)
    pub fn holds_any_table_lock(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_tables.contains(&oid)
            || sets.exclusive_tables.contains(&oid)
            || sets.intention_shared_tables.contains(&oid)
            || sets.intention_exclusive_tables.contains(&oid)
            || sets.shared_intention_exclusive_tables.contains(&oid)
    }

    /// IX, X, or SIX on `oid` (prerequisite for row X locks)
    pub fn holds_write_table_lock(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.exclusive_tables.contains(&oid)
            || sets.intention_exclusive_tables.contains(&oid)
            || sets.shared_intention_exclusive_tables.contains(&oid)
    }

    /// Whether any row lock on `oid` is still held (guards table unlock)
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).map_or(false, |s| !s.is_empty())
            || sets.exclusive_rows.get(&oid).map_or(false, |s| !s.is_empty())
    }
}
