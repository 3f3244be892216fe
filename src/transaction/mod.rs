// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Read-committed transactions over the MVCC tables:
// - State Pattern: transaction lifecycle (Active, Committed, Aborted)
// - Command Pattern: every row write is recorded for undo and redo
// - Row locks with wait-for-graph deadlock detection
//
// ============================================================================

pub mod change;
pub mod locks;
pub mod manager;
pub mod state;

pub use change::Change;
pub use locks::{LockKey, LockManager};
pub use manager::TransactionManager;
pub use state::{Savepoint, Transaction, TransactionId, TransactionState};
