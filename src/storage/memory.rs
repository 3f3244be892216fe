use super::persistence::{LedgerSnapshot, RecoveredLedger};
use super::table::{Ordinal, Table};
use crate::core::{Result, Snapshot};
use crate::ledger::record::{ObjectKey, ProcessedMessage, SentMessage, StoredChange};
use crate::transaction::{Change, Transaction, TransactionId, TransactionManager};
use tokio::sync::{RwLock, RwLockReadGuard};

pub type ChangesTable = Table<ObjectKey, StoredChange>;
pub type SentTable = Table<i64, SentMessage>;
pub type ProcessedTable = Table<(i64, String), ProcessedMessage>;

impl Ordinal for StoredChange {
    fn ordinal(&self) -> i64 {
        self.change_number
    }
}

impl Ordinal for SentMessage {
    fn ordinal(&self) -> i64 {
        self.change_number
    }
}

impl Ordinal for ProcessedMessage {
    fn ordinal(&self) -> i64 {
        self.change_number
    }
}

/// The three ledger tables, each behind its own lock.
///
/// Writers hold one table lock at a time. Readers take all three in table
/// order through [`LedgerStorage::read`], so a statement sees the tables at
/// one instant and never interleaves with vacuum.
pub struct LedgerStorage {
    changes: RwLock<ChangesTable>,
    sent: RwLock<SentTable>,
    processed: RwLock<ProcessedTable>,
}

/// Read guards over all tables plus the statement snapshot.
pub struct LedgerView<'a> {
    pub changes: RwLockReadGuard<'a, ChangesTable>,
    pub sent: RwLockReadGuard<'a, SentTable>,
    pub processed: RwLockReadGuard<'a, ProcessedTable>,
    pub snapshot: Snapshot,
}

impl LedgerView<'_> {
    pub fn is_sent(&self, change_number: i64) -> bool {
        self.sent.get(&change_number, &self.snapshot).is_some()
    }

    /// The live change currently holding `change_number`, if any.
    pub fn change_by_number(&self, change_number: i64) -> Option<&StoredChange> {
        self.changes
            .scan_ordinal_range(change_number..=change_number, &self.snapshot)
            .next()
    }
}

impl LedgerStorage {
    pub fn new() -> Self {
        Self {
            changes: RwLock::new(Table::new("CHANGES")),
            sent: RwLock::new(Table::new("SENT_MESSAGES")),
            processed: RwLock::new(Table::new("PROCESSED_MESSAGES")),
        }
    }

    /// Takes read locks on every table, then the statement snapshot.
    pub async fn read(
        &self,
        transactions: &TransactionManager,
        txn_id: Option<TransactionId>,
    ) -> LedgerView<'_> {
        let changes = self.changes.read().await;
        let sent = self.sent.read().await;
        let processed = self.processed.read().await;
        let snapshot = transactions.statement_snapshot(txn_id).await;
        LedgerView {
            changes,
            sent,
            processed,
            snapshot,
        }
    }

    pub async fn write_change(
        &self,
        txn: &mut Transaction,
        key: &ObjectKey,
        row: Option<StoredChange>,
    ) -> Result<Option<StoredChange>> {
        txn.ensure_active()?;
        let (previous, outcome) = {
            let mut table = self.changes.write().await;
            table.write(key, row.clone(), txn.id().0)
        };
        txn.record_change(Change::ChangeRow {
            key: key.clone(),
            row,
            outcome,
        })?;
        Ok(previous)
    }

    pub async fn write_sent(
        &self,
        txn: &mut Transaction,
        change_number: i64,
        row: Option<SentMessage>,
    ) -> Result<Option<SentMessage>> {
        txn.ensure_active()?;
        let (previous, outcome) = {
            let mut table = self.sent.write().await;
            table.write(&change_number, row.clone(), txn.id().0)
        };
        txn.record_change(Change::SentRow {
            change_number,
            row,
            outcome,
        })?;
        Ok(previous)
    }

    pub async fn write_processed(
        &self,
        txn: &mut Transaction,
        key: (i64, String),
        row: Option<ProcessedMessage>,
    ) -> Result<Option<ProcessedMessage>> {
        txn.ensure_active()?;
        let (previous, outcome) = {
            let mut table = self.processed.write().await;
            table.write(&key, row.clone(), txn.id().0)
        };
        txn.record_change(Change::ProcessedRow { key, row, outcome })?;
        Ok(previous)
    }

    /// Reverts one recorded write of `tx_id`.
    pub async fn undo(&self, change: &Change, tx_id: u64) {
        match change {
            Change::ChangeRow { key, outcome, .. } => {
                self.changes.write().await.undo(key, tx_id, *outcome);
            }
            Change::SentRow {
                change_number,
                outcome,
                ..
            } => {
                self.sent.write().await.undo(change_number, tx_id, *outcome);
            }
            Change::ProcessedRow { key, outcome, .. } => {
                self.processed.write().await.undo(key, tx_id, *outcome);
            }
        }
    }

    /// Committed rows of every table, for a checkpoint.
    pub fn export(view: &LedgerView<'_>, reserved_up_to: i64) -> LedgerSnapshot {
        LedgerSnapshot::new(
            view.changes.scan(&view.snapshot),
            view.sent.scan(&view.snapshot),
            view.processed.scan(&view.snapshot),
            reserved_up_to,
        )
    }

    /// Replaces the table contents with recovered state.
    pub async fn restore(&self, recovered: &RecoveredLedger) {
        let mut changes = self.changes.write().await;
        changes.clear();
        for (key, row) in &recovered.changes {
            changes.restore(key.clone(), Some(row.clone()));
        }
        drop(changes);

        let mut sent = self.sent.write().await;
        sent.clear();
        for (change_number, row) in &recovered.sent {
            sent.restore(*change_number, Some(row.clone()));
        }
        drop(sent);

        let mut processed = self.processed.write().await;
        processed.clear();
        for (key, row) in &recovered.processed {
            processed.restore(key.clone(), Some(row.clone()));
        }
    }

    /// Frees versions no snapshot can see anymore.
    pub async fn vacuum(&self, horizon: u64) -> usize {
        let mut freed = self.changes.write().await.vacuum(horizon);
        freed += self.sent.write().await.vacuum(horizon);
        freed += self.processed.write().await.vacuum(horizon);
        freed
    }

    pub async fn version_count(&self) -> usize {
        self.changes.read().await.version_count()
            + self.sent.read().await.version_count()
            + self.processed.read().await.version_count()
    }
}

impl Default for LedgerStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::{ChangeType, ObjectType, now_millis};

    fn stored(id: &str, change_number: i64) -> StoredChange {
        StoredChange {
            change_number,
            key: ObjectKey::new(id, ObjectType::Entity),
            change_type: ChangeType::Create,
            object_etag: Some("e1".into()),
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_change_visible_only_to_writer() {
        let storage = LedgerStorage::new();
        let transactions = TransactionManager::new();
        let mut txn = transactions.begin().await;
        let row = stored("syn1", 1);
        storage
            .write_change(&mut txn, &row.key, Some(row.clone()))
            .await
            .unwrap();

        let own = storage.read(&transactions, Some(txn.id())).await;
        assert_eq!(own.change_by_number(1), Some(&row));
        drop(own);

        let other = storage.read(&transactions, None).await;
        assert!(other.change_by_number(1).is_none());
    }

    #[tokio::test]
    async fn test_undo_in_reverse_restores_table() {
        let storage = LedgerStorage::new();
        let transactions = TransactionManager::new();
        let mut txn = transactions.begin().await;
        let first = stored("syn1", 1);
        let second = stored("syn1", 2);
        storage
            .write_change(&mut txn, &first.key, Some(first.clone()))
            .await
            .unwrap();
        storage
            .write_change(&mut txn, &second.key, Some(second.clone()))
            .await
            .unwrap();

        for change in txn.rollback().unwrap() {
            storage.undo(&change, txn.id().0).await;
        }
        transactions.finish(txn.id()).await;

        assert_eq!(storage.version_count().await, 0);
    }

    #[tokio::test]
    async fn test_restore_and_export() {
        let storage = LedgerStorage::new();
        let transactions = TransactionManager::new();
        let mut recovered = RecoveredLedger::default();
        let row = stored("syn5", 5);
        recovered.changes.insert(row.key.clone(), row.clone());
        storage.restore(&recovered).await;

        let view = storage.read(&transactions, None).await;
        let snapshot = LedgerStorage::export(&view, 1000);
        assert_eq!(snapshot.changes, vec![row]);
        assert_eq!(snapshot.reserved_up_to, 1000);
    }
}
