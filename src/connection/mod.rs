pub mod config;
pub mod pool;

use crate::core::{DbError, Result};
use crate::facade::LedgerDb;
use crate::ledger::{
    ChangeRecordStore, ProcessedMessageTracker, SentMessageTracker, UnsentMessageQueuer,
};
use crate::storage::LedgerView;
use crate::transaction::{Savepoint, Transaction, TransactionId};
use std::sync::Arc;
use tracing::{Level, event};

/// Ledger connection handle
///
/// Carries the ambient transaction. Outside `begin`/`commit` every write
/// runs in its own transaction; inside, writes join the open one and a
/// failing write only unwinds itself unless the error (deadlock, lock
/// timeout) aborts the whole transaction.
pub struct Connection {
    /// Unique connection ID
    id: u64,
    db: Arc<LedgerDb>,
    state: ConnectionState,
    transaction: Option<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

/// Where a single ledger write started inside the ambient transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteScope {
    savepoint: Savepoint,
    implicit: bool,
}

impl Connection {
    pub(crate) fn new(id: u64, db: Arc<LedgerDb>) -> Self {
        Self {
            id,
            db,
            state: ConnectionState::Active,
            transaction: None,
        }
    }

    /// Get connection ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(Transaction::id)
    }

    /// Begin an explicit transaction
    ///
    /// # Examples
    ///
    /// ```ignore
    /// conn.begin().await?;
    /// conn.changes().replace_change(first).await?;
    /// conn.changes().replace_change(second).await?;
    /// conn.commit().await?;
    /// ```
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == ConnectionState::InTransaction {
            return Err(DbError::TransactionError(
                "Transaction already active".into(),
            ));
        }

        self.transaction = Some(self.db.begin().await);
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    /// Commit the current transaction
    pub async fn commit(&mut self) -> Result<()> {
        let txn = self.take_explicit()?;
        self.db.commit(txn).await
    }

    /// Rollback the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        let txn = self.take_explicit()?;
        self.db.rollback(txn).await
    }

    /// Check if connection is in a transaction
    pub fn is_in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    /// Check if connection is active
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Close the connection, rolling back any open transaction
    pub async fn close(&mut self) -> Result<()> {
        if let Some(txn) = self.transaction.take() {
            self.db.rollback(txn).await?;
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Rolls back any open transaction, leaving the connection reusable.
    pub(crate) async fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = ConnectionState::Active;
        if let Some(txn) = self.transaction.take() {
            self.db.rollback(txn).await?;
        }
        Ok(())
    }

    pub fn changes(&mut self) -> ChangeRecordStore<'_> {
        ChangeRecordStore::new(self)
    }

    pub fn sent_messages(&mut self) -> SentMessageTracker<'_> {
        SentMessageTracker::new(self)
    }

    pub fn processed_messages(&mut self) -> ProcessedMessageTracker<'_> {
        ProcessedMessageTracker::new(self)
    }

    pub fn unsent(&self) -> UnsentMessageQueuer<'_> {
        UnsentMessageQueuer::new(self)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(DbError::ExecutionError("Connection is closed".into()));
        }
        Ok(())
    }

    fn take_explicit(&mut self) -> Result<Transaction> {
        if self.state != ConnectionState::InTransaction {
            return Err(DbError::TransactionError("No active transaction".into()));
        }
        self.state = ConnectionState::Active;
        self.transaction
            .take()
            .ok_or_else(|| DbError::TransactionError("No active transaction".into()))
    }

    /// Statement view as seen by this connection's transaction, if any.
    pub(crate) async fn view(&self) -> Result<LedgerView<'_>> {
        self.ensure_open()?;
        Ok(self.db.view(self.transaction_id()).await)
    }

    /// Opens a write: joins the ambient transaction or starts an implicit
    /// one that `end_write` commits.
    pub(crate) async fn begin_write(&mut self) -> Result<WriteScope> {
        self.ensure_open()?;
        match &self.transaction {
            Some(txn) => Ok(WriteScope {
                savepoint: txn.savepoint(),
                implicit: false,
            }),
            None => {
                let txn = self.db.begin().await;
                let savepoint = txn.savepoint();
                self.transaction = Some(txn);
                Ok(WriteScope {
                    savepoint,
                    implicit: true,
                })
            }
        }
    }

    /// The engine and the transaction a write runs in.
    pub(crate) fn write_parts(&mut self) -> Result<(Arc<LedgerDb>, &mut Transaction)> {
        let db = Arc::clone(&self.db);
        let txn = self
            .transaction
            .as_mut()
            .ok_or_else(|| DbError::TransactionError("No transaction for write".into()))?;
        Ok((db, txn))
    }

    /// Closes a write opened by `begin_write`.
    pub(crate) async fn end_write<T>(&mut self, scope: WriteScope, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                if scope.implicit {
                    if let Some(txn) = self.transaction.take() {
                        self.db.commit(txn).await?;
                    }
                }
                Ok(value)
            }
            Err(err) => {
                if scope.implicit || err.aborts_transaction() {
                    if let Some(txn) = self.transaction.take() {
                        if let Err(rollback_err) = self.db.rollback(txn).await {
                            event!(Level::ERROR, error = %rollback_err, "rollback after failed write failed");
                        }
                    }
                    if !scope.implicit {
                        self.state = ConnectionState::Active;
                        event!(
                            Level::WARN,
                            connection = self.id,
                            error = %err,
                            "transaction aborted"
                        );
                    }
                } else if let Some(txn) = self.transaction.as_mut() {
                    self.db.rollback_to(txn, scope.savepoint).await;
                }
                Err(err)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(txn) = self.transaction.take() else {
            return;
        };
        let db = Arc::clone(&self.db);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = db.rollback(txn).await {
                        event!(Level::ERROR, error = %err, "rollback of dropped connection failed");
                    }
                });
            }
            Err(_) => {
                event!(
                    Level::WARN,
                    connection = self.id,
                    tx_id = txn.id().0,
                    "connection dropped outside a runtime with an open transaction"
                );
            }
        }
    }
}
