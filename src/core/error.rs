use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Lock wait timeout exceeded: {0}")]
    LockTimeout(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// True when the failed transaction may succeed if the caller runs it again.
    ///
    /// The ledger never retries on its own; this only classifies the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Deadlock(_) | DbError::LockTimeout(_))
    }

    /// True for errors that roll back the whole ambient transaction.
    pub(crate) fn aborts_transaction(&self) -> bool {
        self.is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
