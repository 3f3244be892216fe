pub mod error;
pub mod types;

pub use error::{DbError, Result};
pub use types::{READ_ONLY_TX, Snapshot};
