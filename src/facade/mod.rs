pub mod database;

pub use database::{LedgerDb, LedgerStats};
