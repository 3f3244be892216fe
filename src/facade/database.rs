use crate::connection::config::LedgerConfig;
use crate::core::Result;
use crate::storage::{LedgerStorage, LedgerView, PersistenceManager, WalEntry, WalOp};
use crate::transaction::{
    Change, LockKey, LockManager, Savepoint, Transaction, TransactionId, TransactionManager,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

/// Issues change numbers. Numbers are handed out in blocks; each block is
/// logged before its first number is used, so a restart never reissues one.
#[derive(Debug)]
struct ChangeNumberSequence {
    next: i64,
    reserved_up_to: i64,
}

/// The shared ledger engine: tables, transactions, row locks and, when
/// configured, the WAL.
///
/// Lock order is sequence, then persistence, then table locks. The commit
/// path only takes persistence.
pub struct LedgerDb {
    config: LedgerConfig,
    storage: LedgerStorage,
    transactions: TransactionManager,
    locks: LockManager,
    sequence: Mutex<ChangeNumberSequence>,
    persistence: Option<Mutex<PersistenceManager>>,
}

/// Point-in-time counters for the whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub changes: usize,
    pub sent_messages: usize,
    pub processed_messages: usize,
    pub row_versions: usize,
    pub active_transactions: usize,
    pub next_change_number: i64,
    pub persistent: bool,
}

impl LedgerDb {
    /// Opens a ledger, replaying the checkpoint and WAL under
    /// `config.data_dir` when persistence is enabled.
    pub async fn open(config: LedgerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let persistence = match &config.data_dir {
            Some(dir) if config.is_persistent() => {
                std::fs::create_dir_all(dir)?;
                let mut manager = PersistenceManager::new(dir, config.durability)?;
                manager.set_checkpoint_threshold(config.checkpoint_threshold);
                Some(Mutex::new(manager))
            }
            _ => None,
        };

        let db = Self {
            locks: LockManager::new(config.lock_wait_timeout),
            storage: LedgerStorage::new(),
            transactions: TransactionManager::new(),
            sequence: Mutex::new(ChangeNumberSequence {
                next: 1,
                reserved_up_to: 0,
            }),
            persistence,
            config,
        };
        db.recover().await?;
        Ok(Arc::new(db))
    }

    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::open(LedgerConfig::default()).await
    }

    async fn recover(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let recovered = persistence.lock().await.recover()?;
        let Some(recovered) = recovered else {
            event!(Level::INFO, "no ledger state on disk, starting empty");
            return Ok(());
        };

        self.storage.restore(&recovered).await;
        let high_water_mark = recovered.high_water_mark();
        let mut sequence = self.sequence.lock().await;
        sequence.next = high_water_mark + 1;
        sequence.reserved_up_to = high_water_mark;

        event!(
            Level::INFO,
            changes = recovered.changes.len(),
            sent = recovered.sent.len(),
            processed = recovered.processed.len(),
            replayed_entries = recovered.replayed_entries,
            next_change_number = sequence.next,
            "ledger recovered"
        );
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn storage(&self) -> &LedgerStorage {
        &self.storage
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Read guards plus a fresh statement snapshot.
    pub async fn view(&self, txn_id: Option<TransactionId>) -> LedgerView<'_> {
        self.storage.read(&self.transactions, txn_id).await
    }

    pub async fn begin(&self) -> Transaction {
        let txn = self.transactions.begin().await;
        event!(Level::TRACE, tx_id = txn.id().0, "transaction started");
        txn
    }

    /// Waits for an exclusive row lock held until `txn` ends.
    pub(crate) async fn lock_row(&self, txn: &Transaction, key: LockKey) -> Result<()> {
        txn.ensure_active()?;
        self.locks.acquire(txn.id().0, key).await
    }

    /// Next change number, logging a new reservation block when the
    /// current one is used up.
    pub(crate) async fn next_change_number(&self) -> Result<i64> {
        let mut sequence = self.sequence.lock().await;
        let number = sequence.next;
        if number > sequence.reserved_up_to {
            let up_to = number + self.config.sequence_reserve_block - 1;
            if let Some(persistence) = &self.persistence {
                persistence
                    .lock()
                    .await
                    .log(&WalEntry::ReserveChangeNumbers { up_to })?;
            }
            sequence.reserved_up_to = up_to;
            event!(Level::DEBUG, up_to = up_to, "change numbers reserved");
        }
        sequence.next += 1;
        Ok(number)
    }

    /// Makes `txn` durable and visible, then releases its row locks.
    ///
    /// If the WAL append fails the transaction is rolled back and the
    /// append error returned.
    pub async fn commit(&self, txn: Transaction) -> Result<()> {
        let span = info_span!("ledger.commit", tx_id = txn.id().0, changes = txn.change_count());
        self.commit_inner(txn).instrument(span).await
    }

    async fn commit_inner(&self, mut txn: Transaction) -> Result<()> {
        txn.ensure_active()?;
        let tx_id = txn.id();

        match &self.persistence {
            Some(persistence) => {
                let ops: Vec<WalOp> = txn.changes().iter().filter_map(Change::redo).collect();
                let mut guard = persistence.lock().await;
                if !ops.is_empty() {
                    let appended = guard.log(&WalEntry::Commit {
                        tx_id: tx_id.0,
                        ops,
                    });
                    if let Err(err) = appended {
                        drop(guard);
                        event!(Level::ERROR, error = %err, "commit append failed");
                        self.rollback(txn).await?;
                        return Err(err);
                    }
                }
                // Still under the persistence lock so a checkpoint never
                // sees a commit whose WAL entry it is about to discard.
                self.transactions.finish(tx_id).await;
            }
            None => self.transactions.finish(tx_id).await,
        }

        txn.commit()?;
        let released = self.locks.release_all(tx_id.0)?;
        event!(
            Level::DEBUG,
            locks_released = released,
            elapsed_ms = txn.duration().as_millis() as u64,
            "transaction committed"
        );

        if let Err(err) = self.maybe_checkpoint().await {
            event!(Level::WARN, error = %err, "automatic checkpoint failed");
        }
        Ok(())
    }

    /// Undoes every write of `txn`, newest first, then releases its locks.
    pub async fn rollback(&self, mut txn: Transaction) -> Result<()> {
        let tx_id = txn.id();
        let undone = txn.rollback()?;
        for change in &undone {
            self.storage.undo(change, tx_id.0).await;
        }
        self.transactions.finish(tx_id).await;
        let released = self.locks.release_all(tx_id.0)?;
        event!(
            Level::DEBUG,
            tx_id = tx_id.0,
            undone = undone.len(),
            locks_released = released,
            "transaction rolled back"
        );
        Ok(())
    }

    /// Undoes the writes made after `savepoint`; locks stay held.
    pub async fn rollback_to(&self, txn: &mut Transaction, savepoint: Savepoint) {
        let undone = txn.unwind_to(savepoint);
        for change in &undone {
            self.storage.undo(change, txn.id().0).await;
        }
        if !undone.is_empty() {
            event!(
                Level::DEBUG,
                tx_id = txn.id().0,
                undone = undone.len(),
                "statement rolled back to savepoint"
            );
        }
    }

    /// Writes a snapshot of all committed rows and truncates the WAL.
    ///
    /// A no-op for memory-only ledgers.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let sequence = self.sequence.lock().await;
        let mut guard = persistence.lock().await;
        let snapshot = {
            let view = self.view(None).await;
            LedgerStorage::export(&view, sequence.reserved_up_to)
        };
        guard.checkpoint(&snapshot)?;
        drop(guard);
        drop(sequence);

        let freed = self.vacuum().await;
        event!(
            Level::INFO,
            rows = snapshot.metadata.row_count,
            versions_freed = freed,
            "checkpoint written"
        );
        Ok(())
    }

    async fn maybe_checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if !persistence.lock().await.needs_checkpoint() {
            return Ok(());
        }
        self.checkpoint().await
    }

    /// Drops row versions that no running or future statement can see.
    pub async fn vacuum(&self) -> usize {
        let horizon = self.transactions.horizon().await;
        self.storage.vacuum(horizon).await
    }

    pub async fn stats(&self) -> LedgerStats {
        let (changes, sent_messages, processed_messages) = {
            let view = self.view(None).await;
            (
                view.changes.count(&view.snapshot),
                view.sent.count(&view.snapshot),
                view.processed.count(&view.snapshot),
            )
        };
        LedgerStats {
            changes,
            sent_messages,
            processed_messages,
            row_versions: self.storage.version_count().await,
            active_transactions: self.transactions.active_count().await,
            next_change_number: self.sequence.lock().await.next,
            persistent: self.is_persistent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::{ChangeType, ObjectKey, ObjectType, StoredChange, now_millis};
    use crate::storage::DurabilityMode;
    use tempfile::TempDir;

    fn stored(id: &str, change_number: i64) -> StoredChange {
        StoredChange {
            change_number,
            key: ObjectKey::new(id, ObjectType::Entity),
            change_type: ChangeType::Create,
            object_etag: Some("etag".into()),
            timestamp: now_millis(),
        }
    }

    async fn insert(db: &LedgerDb, id: &str) -> i64 {
        let mut txn = db.begin().await;
        let number = db.next_change_number().await.unwrap();
        let row = stored(id, number);
        db.storage()
            .write_change(&mut txn, &row.key, Some(row.clone()))
            .await
            .unwrap();
        db.commit(txn).await.unwrap();
        number
    }

    #[tokio::test]
    async fn test_change_numbers_start_at_one() {
        let db = LedgerDb::in_memory().await.unwrap();
        assert_eq!(db.next_change_number().await.unwrap(), 1);
        assert_eq!(db.next_change_number().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let db = LedgerDb::in_memory().await.unwrap();
        insert(&db, "syn1").await;

        let view = db.view(None).await;
        assert!(view.change_by_number(1).is_some());
        drop(view);
        assert_eq!(db.stats().await.active_transactions, 0);
    }

    #[tokio::test]
    async fn test_rollback_releases_locks_and_discards_rows() {
        let db = LedgerDb::in_memory().await.unwrap();
        let mut txn = db.begin().await;
        let key = LockKey::new("CHANGES", "syn1");
        db.lock_row(&txn, key.clone()).await.unwrap();
        let row = stored("syn1", db.next_change_number().await.unwrap());
        db.storage()
            .write_change(&mut txn, &row.key.clone(), Some(row))
            .await
            .unwrap();

        db.rollback(txn).await.unwrap();

        assert_eq!(db.locks().owner_of(&key).unwrap(), None);
        assert_eq!(db.stats().await.changes, 0);
        assert_eq!(db.storage().version_count().await, 0);
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_keeps_earlier_writes() {
        let db = LedgerDb::in_memory().await.unwrap();
        let mut txn = db.begin().await;
        let first = stored("syn1", 1);
        db.storage()
            .write_change(&mut txn, &first.key.clone(), Some(first))
            .await
            .unwrap();
        let savepoint = txn.savepoint();
        let second = stored("syn2", 2);
        db.storage()
            .write_change(&mut txn, &second.key.clone(), Some(second))
            .await
            .unwrap();

        db.rollback_to(&mut txn, savepoint).await;
        db.commit(txn).await.unwrap();

        let view = db.view(None).await;
        assert!(view.change_by_number(1).is_some());
        assert!(view.change_by_number(2).is_none());
    }

    #[tokio::test]
    async fn test_recovery_resumes_after_reserved_block() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig::new()
            .data_dir(dir.path())
            .durability(DurabilityMode::Sync)
            .sequence_reserve_block(10);

        {
            let db = LedgerDb::open(config.clone()).await.unwrap();
            assert_eq!(insert(&db, "syn1").await, 1);
            assert_eq!(insert(&db, "syn2").await, 2);
        }

        let db = LedgerDb::open(config).await.unwrap();
        let stats = db.stats().await;
        assert_eq!(stats.changes, 2);
        assert_eq!(stats.next_change_number, 11);
        assert!(stats.persistent);
    }

    #[tokio::test]
    async fn test_checkpoint_then_recover() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig::new()
            .data_dir(dir.path())
            .durability(DurabilityMode::Sync);

        {
            let db = LedgerDb::open(config.clone()).await.unwrap();
            insert(&db, "syn1").await;
            db.checkpoint().await.unwrap();
            insert(&db, "syn2").await;
        }

        let db = LedgerDb::open(config).await.unwrap();
        let view = db.view(None).await;
        assert!(view.change_by_number(1).is_some());
        assert!(view.change_by_number(2).is_some());
    }

    #[tokio::test]
    async fn test_uncommitted_work_is_not_recovered() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig::new()
            .data_dir(dir.path())
            .durability(DurabilityMode::Sync);

        {
            let db = LedgerDb::open(config.clone()).await.unwrap();
            insert(&db, "syn1").await;
            let mut txn = db.begin().await;
            let row = stored("syn2", db.next_change_number().await.unwrap());
            db.storage()
                .write_change(&mut txn, &row.key.clone(), Some(row))
                .await
                .unwrap();
        }

        let db = LedgerDb::open(config).await.unwrap();
        assert_eq!(db.stats().await.changes, 1);
    }
}
