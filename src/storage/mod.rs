pub mod memory;
pub mod persistence;
pub mod table;

pub use memory::{LedgerStorage, LedgerView};
pub use persistence::{DurabilityMode, PersistenceManager, RecoveredLedger, WalEntry, WalOp};
pub use table::{Ordinal, Table, WriteOutcome};
