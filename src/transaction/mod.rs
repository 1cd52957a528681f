pub mod concurrency;

// Public exports
pub use concurrency::transaction::{
    AbortReason, IsolationLevel, LockMode, Transaction, TransactionAbortError, TransactionState,
};
pub use concurrency::transaction_manager::TransactionManager;
pub use concurrency::lock_manager::LockManager;
