pub mod transaction;
pub mod transaction_manager;
pub mod request_queue;
pub mod lock_manager;
pub mod deadlock;

pub use transaction::{AbortReason, IsolationLevel, LockMode, Transaction, TransactionState};
pub use transaction_manager::TransactionManager;
pub use lock_manager::LockManager;
