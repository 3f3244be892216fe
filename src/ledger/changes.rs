//! The CHANGES table: one live change per object, renumbered on every
//! replace.

use super::ordering::sort_by_object_id;
use super::record::{ChangeRecord, ObjectId, ObjectKey, ObjectType, StoredChange, now_millis};
use super::validation::{PendingChange, require_key, validate_batch, validate_change};
use super::{change_lock, processed_lock, purge_marks};
use crate::connection::Connection;
use crate::core::{DbError, Result};
use crate::facade::LedgerDb;
use crate::transaction::Transaction;
use tracing::{Instrument, Level, event, info_span};

/// Write and query access to the CHANGES table through a connection.
///
/// Writes join the connection's ambient transaction, or run in their own
/// when there is none.
pub struct ChangeRecordStore<'c> {
    conn: &'c mut Connection,
}

impl<'c> ChangeRecordStore<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Upserts the change for the record's object under a fresh change
    /// number and returns the stored record.
    ///
    /// # Errors
    /// `InvalidArgument` if the record is missing its id, type or change
    /// type, or an etag while not a DELETE. Nothing is written in that case.
    pub async fn replace_change(&mut self, change: ChangeRecord) -> Result<ChangeRecord> {
        let pending = validate_change(&change)?;
        let span = info_span!("ledger.replace", key = %pending.key);
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => replace_one(&db, txn, pending).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }

    /// Replaces every change of the batch in one atomic unit.
    ///
    /// The batch is sorted by object id first, so concurrent batches lock
    /// shared rows in the same order; the result keeps that sorted order. A
    /// single invalid record rejects the whole batch before any write.
    pub async fn replace_changes(&mut self, batch: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let batch = sort_by_object_id(batch);
        let pending = validate_batch(&batch)?;
        let span = info_span!("ledger.replace_batch", size = pending.len());
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => replace_all(&db, txn, pending).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }

    /// Live changes with `change_number >= min_change_number`, optionally of
    /// one type, ascending, at most `limit` of them.
    pub async fn list_changes(
        &self,
        min_change_number: i64,
        object_type: Option<ObjectType>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>> {
        if limit < 0 {
            return Err(DbError::InvalidArgument(
                "Limit cannot be less than zero".into(),
            ));
        }
        let view = self.conn.view().await?;
        Ok(view
            .changes
            .scan_ordinal_range(min_change_number.., &view.snapshot)
            .filter(|change| object_type.is_none_or(|t| change.key.object_type == t))
            .take(limit as usize)
            .map(StoredChange::to_record)
            .collect())
    }

    /// Highest live change number, 0 for an empty ledger.
    pub async fn get_current_change_number(&self) -> Result<i64> {
        let view = self.conn.view().await?;
        Ok(view.changes.max_ordinal(&view.snapshot).unwrap_or(0))
    }

    /// Lowest live change number, 0 for an empty ledger.
    pub async fn get_minimum_change_number(&self) -> Result<i64> {
        let view = self.conn.view().await?;
        Ok(view.changes.min_ordinal(&view.snapshot).unwrap_or(0))
    }

    pub async fn get_count(&self) -> Result<u64> {
        let view = self.conn.view().await?;
        Ok(view.changes.count(&view.snapshot) as u64)
    }

    pub async fn does_change_number_exist(&self, change_number: i64) -> Result<bool> {
        let view = self.conn.view().await?;
        Ok(view.change_by_number(change_number).is_some())
    }

    /// Etag of the live change for an object.
    ///
    /// # Errors
    /// `NotFound` when the object has no change, or its change carries no
    /// etag.
    pub async fn get_etag(
        &self,
        object_id: Option<&str>,
        object_type: Option<ObjectType>,
    ) -> Result<String> {
        let key = require_key(object_id, object_type)?;
        let view = self.conn.view().await?;
        view.changes
            .get(&key, &view.snapshot)
            .and_then(|change| change.object_etag.clone())
            .ok_or_else(|| DbError::NotFound(format!("No etag for {}", key)))
    }

    /// Live changes of the given objects, ascending by change number.
    pub async fn get_changes_for_object_ids<I>(
        &self,
        object_type: ObjectType,
        object_ids: I,
    ) -> Result<Vec<ChangeRecord>>
    where
        I: IntoIterator,
        I::Item: Into<ObjectId>,
    {
        let keys: Vec<ObjectKey> = object_ids
            .into_iter()
            .map(|id| ObjectKey::new(id, object_type))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let view = self.conn.view().await?;
        let mut found: Vec<&StoredChange> = keys
            .iter()
            .filter_map(|key| view.changes.get(key, &view.snapshot))
            .collect();
        found.sort_by_key(|change| change.change_number);
        found.dedup_by_key(|change| change.change_number);
        Ok(found.into_iter().map(StoredChange::to_record).collect())
    }

    /// Removes the live change of one object together with its sent and
    /// processed marks. Returns false when the object had no change.
    pub async fn delete_change(
        &mut self,
        object_id: Option<&str>,
        object_type: Option<ObjectType>,
    ) -> Result<bool> {
        let key = require_key(object_id, object_type)?;
        let span = info_span!("ledger.delete", key = %key);
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => delete_one(&db, txn, &key).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }

    /// Administrative purge of every change, sent mark and processed mark.
    /// Returns the number of changes removed.
    pub async fn delete_all_changes(&mut self) -> Result<usize> {
        let span = info_span!("ledger.purge");
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => delete_all(&db, txn).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }
}

async fn replace_one(
    db: &LedgerDb,
    txn: &mut Transaction,
    pending: PendingChange,
) -> Result<ChangeRecord> {
    db.lock_row(txn, change_lock(&pending.key)).await?;
    let change_number = db.next_change_number().await?;
    let row = StoredChange {
        change_number,
        key: pending.key,
        change_type: pending.change_type,
        object_etag: pending.object_etag,
        timestamp: now_millis(),
    };

    let previous = db
        .storage()
        .write_change(txn, &row.key, Some(row.clone()))
        .await?;
    if let Some(previous) = &previous {
        purge_marks(db, txn, previous.change_number).await?;
    }

    event!(
        Level::DEBUG,
        key = %row.key,
        change_number = change_number,
        retired = previous.map(|p| p.change_number),
        "change replaced"
    );
    Ok(row.to_record())
}

async fn replace_all(
    db: &LedgerDb,
    txn: &mut Transaction,
    pending: Vec<PendingChange>,
) -> Result<Vec<ChangeRecord>> {
    let mut stored = Vec::with_capacity(pending.len());
    for change in pending {
        stored.push(replace_one(db, txn, change).await?);
    }
    Ok(stored)
}

async fn delete_one(db: &LedgerDb, txn: &mut Transaction, key: &ObjectKey) -> Result<bool> {
    db.lock_row(txn, change_lock(key)).await?;
    let Some(previous) = db.storage().write_change(txn, key, None).await? else {
        event!(Level::DEBUG, "no change to delete");
        return Ok(false);
    };
    purge_marks(db, txn, previous.change_number).await?;
    event!(
        Level::DEBUG,
        change_number = previous.change_number,
        "change deleted"
    );
    Ok(true)
}

async fn delete_all(db: &LedgerDb, txn: &mut Transaction) -> Result<usize> {
    let keys: Vec<ObjectKey> = {
        let view = db.view(Some(txn.id())).await;
        view.changes
            .scan(&view.snapshot)
            .into_iter()
            .map(|change| change.key)
            .collect()
    };

    let mut deleted = 0;
    for key in &keys {
        if delete_one(db, txn, key).await? {
            deleted += 1;
        }
    }

    // Marks whose change is already gone, e.g. restored from an older
    // checkpoint.
    let (orphan_sent, orphan_processed) = {
        let view = db.view(Some(txn.id())).await;
        (
            view.sent.scan(&view.snapshot),
            view.processed.scan(&view.snapshot),
        )
    };
    for sent in orphan_sent {
        let key = ObjectKey::new(sent.object_id, sent.object_type);
        db.lock_row(txn, change_lock(&key)).await?;
        db.storage().write_sent(txn, sent.change_number, None).await?;
    }
    for processed in orphan_processed {
        db.lock_row(txn, processed_lock(processed.change_number, &processed.queue_name))
            .await?;
        db.storage()
            .write_processed(txn, (processed.change_number, processed.queue_name), None)
            .await?;
    }

    event!(Level::INFO, deleted = deleted, "ledger purged");
    Ok(deleted)
}
