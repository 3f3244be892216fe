//! Per-queue processed marks for sent changes.

use super::{change_lock, processed_lock};
use super::record::{ChangeRecord, ProcessedMessage, StoredChange, now_millis};
use crate::connection::Connection;
use crate::core::{DbError, Result};
use crate::facade::LedgerDb;
use crate::transaction::Transaction;
use tracing::{Instrument, Level, event, info_span};

pub struct ProcessedMessageTracker<'c> {
    conn: &'c mut Connection,
}

impl<'c> ProcessedMessageTracker<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Records that `queue_name` processed `change_number`, refreshing the
    /// timestamp when it already had.
    ///
    /// Returns false, writing nothing, when the number is no longer live.
    pub async fn register_message_processed(
        &mut self,
        change_number: i64,
        queue_name: &str,
    ) -> Result<bool> {
        if queue_name.is_empty() {
            return Err(DbError::InvalidArgument("Queue name cannot be empty".into()));
        }
        let span = info_span!(
            "ledger.mark_processed",
            change_number = change_number,
            queue = queue_name
        );
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => mark_processed(&db, txn, change_number, queue_name).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }

    /// Sent changes not yet processed by `queue_name`, ascending by change
    /// number, at most `limit`.
    pub async fn list_not_processed_messages(
        &self,
        queue_name: &str,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>> {
        if limit < 0 {
            return Err(DbError::InvalidArgument(
                "Limit cannot be less than zero".into(),
            ));
        }
        let view = self.conn.view().await?;
        let queue = queue_name.to_string();
        Ok(view
            .changes
            .scan_ordinal_range(.., &view.snapshot)
            .filter(|change| view.is_sent(change.change_number))
            .filter(|change| {
                view.processed
                    .get(&(change.change_number, queue.clone()), &view.snapshot)
                    .is_none()
            })
            .take(limit as usize)
            .map(StoredChange::to_record)
            .collect())
    }
}

/// Writes a processed mark under the change lock of the object that owns
/// `change_number`, the same lock a replace takes before purging marks.
async fn mark_processed(
    db: &LedgerDb,
    txn: &mut Transaction,
    change_number: i64,
    queue_name: &str,
) -> Result<bool> {
    let key = {
        let view = db.view(Some(txn.id())).await;
        view.change_by_number(change_number).map(|c| c.key.clone())
    };
    let Some(key) = key else {
        event!(Level::DEBUG, "ignoring processed mark for retired change number");
        return Ok(false);
    };

    db.lock_row(txn, change_lock(&key)).await?;
    let still_live = {
        let view = db.view(Some(txn.id())).await;
        view.changes
            .get(&key, &view.snapshot)
            .is_some_and(|c| c.change_number == change_number)
    };
    if !still_live {
        event!(Level::DEBUG, "change number retired while waiting for its lock");
        return Ok(false);
    }

    db.lock_row(txn, processed_lock(change_number, queue_name))
        .await?;
    let row = ProcessedMessage {
        change_number,
        queue_name: queue_name.to_string(),
        timestamp: now_millis(),
    };
    let previous = db
        .storage()
        .write_processed(txn, (change_number, queue_name.to_string()), Some(row))
        .await?;
    event!(
        Level::DEBUG,
        refreshed = previous.is_some(),
        "message processed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use crate::LedgerClient;
    use crate::ledger::record::{ChangeRecord, ChangeType, ObjectType};

    fn entity(id: &str) -> ChangeRecord {
        ChangeRecord::new(id, ObjectType::Entity, ChangeType::Create).with_etag("e")
    }

    fn numbers(records: &[ChangeRecord]) -> Vec<i64> {
        records.iter().filter_map(|r| r.change_number).collect()
    }

    #[tokio::test]
    async fn test_only_sent_unprocessed_changes_listed() {
        let client = LedgerClient::in_memory().await.unwrap();
        let mut conn = client.connect().await.unwrap();
        conn.changes()
            .replace_changes(vec![entity("syn1"), entity("syn2"), entity("syn3")])
            .await
            .unwrap();
        conn.sent_messages().register_message_sent(1).await.unwrap();
        conn.sent_messages().register_message_sent(2).await.unwrap();

        let pending = conn
            .processed_messages()
            .list_not_processed_messages("search", 10)
            .await
            .unwrap();
        assert_eq!(numbers(&pending), vec![1, 2]);

        conn.processed_messages()
            .register_message_processed(1, "search")
            .await
            .unwrap();
        // Registering again only refreshes the timestamp.
        conn.processed_messages()
            .register_message_processed(1, "search")
            .await
            .unwrap();

        let pending = conn
            .processed_messages()
            .list_not_processed_messages("search", 10)
            .await
            .unwrap();
        assert_eq!(numbers(&pending), vec![2]);

        let other_queue = conn
            .processed_messages()
            .list_not_processed_messages("cache", 10)
            .await
            .unwrap();
        assert_eq!(numbers(&other_queue), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_replace_clears_processed_marks() {
        let client = LedgerClient::in_memory().await.unwrap();
        let mut conn = client.connect().await.unwrap();
        conn.changes().replace_change(entity("syn1")).await.unwrap();
        conn.sent_messages().register_message_sent(1).await.unwrap();
        conn.processed_messages()
            .register_message_processed(1, "search")
            .await
            .unwrap();

        conn.changes().replace_change(entity("syn1")).await.unwrap();
        assert_eq!(client.db().stats().await.processed_messages, 0);
    }

    #[tokio::test]
    async fn test_retired_number_gets_no_processed_mark() {
        let client = LedgerClient::in_memory().await.unwrap();
        let mut conn = client.connect().await.unwrap();
        conn.changes().replace_change(entity("syn1")).await.unwrap();
        conn.sent_messages().register_message_sent(1).await.unwrap();
        conn.changes().replace_change(entity("syn1")).await.unwrap();

        let written = conn
            .processed_messages()
            .register_message_processed(1, "search")
            .await
            .unwrap();
        assert!(!written);
        assert!(
            !conn
                .processed_messages()
                .register_message_processed(99, "search")
                .await
                .unwrap()
        );
        assert_eq!(client.db().stats().await.processed_messages, 0);

        assert!(
            conn.processed_messages()
                .register_message_processed(2, "search")
                .await
                .unwrap()
        );
        assert_eq!(client.db().stats().await.processed_messages, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processed_mark_waits_for_pending_replace() {
        let client = LedgerClient::in_memory().await.unwrap();
        client.replace_change(entity("syn1")).await.unwrap();
        client.register_message_sent(1).await.unwrap();

        let mut writer = client.connect().await.unwrap();
        writer.begin().await.unwrap();
        writer.changes().replace_change(entity("syn1")).await.unwrap();

        let marker = client.clone();
        let marking = tokio::spawn(async move {
            let mut conn = marker.connect().await.unwrap();
            conn.processed_messages()
                .register_message_processed(1, "search")
                .await
                .unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        writer.commit().await.unwrap();

        // The replace retired number 1 before the mark could be written.
        assert!(!marking.await.unwrap());
        assert_eq!(client.db().stats().await.processed_messages, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_name_rejected() {
        let client = LedgerClient::in_memory().await.unwrap();
        let mut conn = client.connect().await.unwrap();
        assert!(
            conn.processed_messages()
                .register_message_processed(1, "")
                .await
                .is_err()
        );
    }
}
