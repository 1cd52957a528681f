use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;

use opaldb::common::types::Rid;
use opaldb::transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionManager, TransactionState,
};

const TABLE_A: u32 = 1;
const TABLE_B: u32 = 2;

fn setup() -> (Arc<TransactionManager>, Arc<LockManager>) {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::new(txn_manager.clone()));
    (txn_manager, lock_manager)
}

#[test]
fn test_shared_lock_blocks_exclusive_until_unlock() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;

    let granted = Arc::new(AtomicBool::new(false));
    let waiter = {
        let lock_manager = lock_manager.clone();
        let t2 = t2.clone();
        let granted = granted.clone();
        std::thread::spawn(move || {
            lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap();
            granted.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!granted.load(Ordering::SeqCst), "X must wait behind S");

    lock_manager.unlock_table(&t1, TABLE_A)?;
    // Unlocking S under REPEATABLE_READ starts the shrinking phase
    assert_eq!(t1.state(), TransactionState::Shrinking);

    waiter.join().unwrap();
    assert!(granted.load(Ordering::SeqCst));

    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert!(snapshot
        .requests
        .contains(&(t2.id(), LockMode::Exclusive, true)));
    Ok(())
}

#[test]
fn test_compatible_shared_locks_coexist() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::IntentionShared, TABLE_A)?;
    lock_manager.lock_table(&t2, LockMode::Shared, TABLE_A)?;
    lock_manager.lock_table(&t3, LockMode::Shared, TABLE_A)?;

    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert_eq!(snapshot.requests.iter().filter(|r| r.2).count(), 3);
    Ok(())
}

#[test]
fn test_upgrade_takes_precedence_then_waiter_proceeds() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;
    // Sole holder: the S -> X upgrade is granted immediately
    lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A)?;

    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert_eq!(snapshot.requests, vec![(t1.id(), LockMode::Exclusive, true)]);
    assert_eq!(snapshot.upgrading, None);

    let granted = Arc::new(AtomicBool::new(false));
    let waiter = {
        let lock_manager = lock_manager.clone();
        let t2 = t2.clone();
        let granted = granted.clone();
        std::thread::spawn(move || {
            lock_manager.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();
            granted.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!granted.load(Ordering::SeqCst), "S must wait behind the upgraded X");

    lock_manager.unlock_table(&t1, TABLE_A)?;
    waiter.join().unwrap();
    assert!(granted.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_second_concurrent_upgrade_conflicts() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t0 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t0, LockMode::Shared, TABLE_A)?;
    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;
    lock_manager.lock_table(&t3, LockMode::IntentionShared, TABLE_A)?;

    // T1's upgrade to X cannot be granted while T0 and T3 hold locks
    let upgrader = {
        let lock_manager = lock_manager.clone();
        let t1 = t1.clone();
        std::thread::spawn(move || lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A))
    };

    std::thread::sleep(Duration::from_millis(100));
    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert_eq!(snapshot.upgrading, Some(t1.id()));

    // A second upgrade on the same queue is refused outright
    let err = lock_manager
        .lock_table(&t3, LockMode::Shared, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::UpgradeConflict);
    assert_eq!(t3.state(), TransactionState::Aborted);

    // Clearing the other holders lets the first upgrade through
    txn_manager.abort(t3.id(), &lock_manager)?;
    lock_manager.unlock_table(&t0, TABLE_A)?;
    upgrader.join().unwrap()?;

    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert_eq!(snapshot.requests, vec![(t1.id(), LockMode::Exclusive, true)]);
    Ok(())
}

#[test]
fn test_same_mode_relock_is_idempotent() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;
    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;

    let snapshot = lock_manager.table_queue_snapshot(TABLE_A).unwrap();
    assert_eq!(snapshot.requests.len(), 1);
    Ok(())
}

#[test]
fn test_illegal_upgrades_abort() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A)?;
    let err = lock_manager
        .lock_table(&t1, LockMode::Shared, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);
    assert_eq!(t1.state(), TransactionState::Aborted);
    Ok(())
}

#[test]
fn test_read_uncommitted_rejects_share_modes() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::ReadUncommitted);

    let err = lock_manager
        .lock_table(&t1, LockMode::Shared, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
    assert_eq!(t1.state(), TransactionState::Aborted);

    let t2 = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let err = lock_manager
        .lock_row(&t2, LockMode::Shared, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
    Ok(())
}

#[test]
fn test_repeatable_read_forbids_locks_while_shrinking() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A)?;
    lock_manager.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lock_manager
        .lock_table(&t1, LockMode::Shared, TABLE_B)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    Ok(())
}

#[test]
fn test_read_committed_allows_only_shared_while_shrinking() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::ReadCommitted);

    lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A)?;
    lock_manager.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);

    // IS and S stay legal in the shrinking phase
    lock_manager.lock_table(&t1, LockMode::IntentionShared, TABLE_B)?;
    lock_manager.lock_table(&t1, LockMode::Shared, TABLE_B)?;

    let err = lock_manager
        .lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    Ok(())
}

#[test]
fn test_row_locks_require_table_locks() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 7);

    // No table lock at all
    let err = lock_manager
        .lock_row(&t1, LockMode::Shared, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);

    // IS is enough for a row S but not for a row X
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&t2, LockMode::IntentionShared, TABLE_A)?;
    lock_manager.lock_row(&t2, LockMode::Shared, TABLE_A, rid)?;
    let err = lock_manager
        .lock_row(&t2, LockMode::Exclusive, TABLE_A, Rid::new(3, 8))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);

    // IX carries row X
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&t3, LockMode::IntentionExclusive, TABLE_B)?;
    lock_manager.lock_row(&t3, LockMode::Exclusive, TABLE_B, Rid::new(4, 1))?;
    Ok(())
}

#[test]
fn test_intention_modes_are_forbidden_on_rows() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&t1, LockMode::IntentionShared, TABLE_A)?;

    for mode in [
        LockMode::IntentionShared,
        LockMode::IntentionExclusive,
        LockMode::SharedIntentionExclusive,
    ] {
        let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
        let err = lock_manager
            .lock_row(&txn, mode, TABLE_A, Rid::new(1, 1))
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::AttemptedIntentionLockOnRow);
    }
    Ok(())
}

#[test]
fn test_table_unlock_requires_rows_released_first() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(5, 5);

    lock_manager.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?;
    lock_manager.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid)?;

    let err = lock_manager.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);
    Ok(())
}

#[test]
fn test_unlock_without_lock_aborts() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    let err = lock_manager.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);

    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let err = lock_manager
        .unlock_row(&t2, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);
    Ok(())
}

#[test]
fn test_shrink_transitions_per_isolation_level() -> Result<()> {
    let (txn_manager, lock_manager) = setup();

    // Intention unlocks never force shrinking
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&t1, LockMode::IntentionShared, TABLE_A)?;
    lock_manager.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Growing);

    // READ_COMMITTED shrinks on X only
    let t2 = txn_manager.begin(IsolationLevel::ReadCommitted);
    lock_manager.lock_table(&t2, LockMode::Shared, TABLE_A)?;
    lock_manager.unlock_table(&t2, TABLE_A)?;
    assert_eq!(t2.state(), TransactionState::Growing);
    lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A)?;
    lock_manager.unlock_table(&t2, TABLE_A)?;
    assert_eq!(t2.state(), TransactionState::Shrinking);

    // Any row unlock shrinks under REPEATABLE_READ
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(9, 1);
    lock_manager.lock_table(&t3, LockMode::IntentionShared, TABLE_A)?;
    lock_manager.lock_row(&t3, LockMode::Shared, TABLE_A, rid)?;
    lock_manager.unlock_row(&t3, TABLE_A, rid)?;
    assert_eq!(t3.state(), TransactionState::Shrinking);
    Ok(())
}

#[test]
fn test_commit_releases_remaining_locks() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(2, 2);

    lock_manager.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?;
    lock_manager.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid)?;
    txn_manager.commit(t1.id(), &lock_manager)?;

    // A new transaction takes X on both immediately
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&t2, LockMode::IntentionExclusive, TABLE_A)?;
    lock_manager.lock_row(&t2, LockMode::Exclusive, TABLE_A, rid)?;
    Ok(())
}

#[test]
fn test_row_upgrade_shared_to_exclusive() -> Result<()> {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(6, 6);

    lock_manager.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?;
    lock_manager.lock_row(&t1, LockMode::Shared, TABLE_A, rid)?;
    lock_manager.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid)?;

    let snapshot = lock_manager.row_queue_snapshot(rid).unwrap();
    assert_eq!(snapshot.requests, vec![(t1.id(), LockMode::Exclusive, true)]);

    // X -> S on a row is not an upgrade
    let err = lock_manager
        .lock_row(&t1, LockMode::Shared, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);
    Ok(())
}
