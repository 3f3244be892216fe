//! The SENT_MESSAGES table: which change numbers reached downstream.

use super::change_lock;
use super::record::{ChangeRecord, ObjectKey, ObjectType, SentMessage, now_millis};
use super::validation::validate_sent_batch;
use crate::connection::Connection;
use crate::core::Result;
use crate::facade::LedgerDb;
use crate::transaction::Transaction;
use tracing::{Instrument, Level, event, info_span};

/// Records and inspects sent marks through a connection.
pub struct SentMessageTracker<'c> {
    conn: &'c mut Connection,
}

impl<'c> SentMessageTracker<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Marks `change_number` as sent.
    ///
    /// Returns true when a new mark was written. Marking a number twice,
    /// or a number that was retired by a later replace, is a no-op.
    pub async fn register_message_sent(&mut self, change_number: i64) -> Result<bool> {
        let span = info_span!("ledger.mark_sent", change_number = change_number);
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => mark_sent(&db, txn, &[change_number]).await,
                Err(err) => Err(err),
            };
            self.conn
                .end_write(scope, result)
                .await
                .map(|written| written > 0)
        }
        .instrument(span)
        .await
    }

    /// Marks a batch of messages of one object type as sent, in one
    /// transaction. Returns how many new marks were written.
    ///
    /// # Errors
    /// `InvalidArgument` if any message has another object type or no
    /// change number; nothing is written in that case.
    pub async fn register_messages_sent(
        &mut self,
        object_type: ObjectType,
        batch: &[ChangeRecord],
    ) -> Result<usize> {
        let numbers = validate_sent_batch(object_type, batch)?;
        if numbers.is_empty() {
            return Ok(0);
        }
        let span = info_span!(
            "ledger.mark_sent_batch",
            object_type = %object_type,
            size = numbers.len()
        );
        async move {
            let scope = self.conn.begin_write().await?;
            let result = match self.conn.write_parts() {
                Ok((db, txn)) => mark_sent(&db, txn, &numbers).await,
                Err(err) => Err(err),
            };
            self.conn.end_write(scope, result).await
        }
        .instrument(span)
        .await
    }

    pub async fn is_sent(&self, change_number: i64) -> Result<bool> {
        let view = self.conn.view().await?;
        Ok(view.is_sent(change_number))
    }

    pub async fn get_sent_message(&self, change_number: i64) -> Result<Option<SentMessage>> {
        let view = self.conn.view().await?;
        Ok(view.sent.get(&change_number, &view.snapshot).cloned())
    }

    /// Highest sent change number not above `less_than_or_equal`, or -1.
    pub async fn get_max_sent_change_number(&self, less_than_or_equal: i64) -> Result<i64> {
        let view = self.conn.view().await?;
        Ok(view
            .sent
            .max_ordinal_in(..=less_than_or_equal, &view.snapshot)
            .unwrap_or(-1))
    }
}

/// Writes sent marks for the live changes among `numbers`.
///
/// Each mark is written under the change lock of its object, after
/// re-reading that the number is still the object's live one; keys are
/// locked in object order like every other batch writer.
async fn mark_sent(db: &LedgerDb, txn: &mut Transaction, numbers: &[i64]) -> Result<usize> {
    let mut targets: Vec<(ObjectKey, i64)> = {
        let view = db.view(Some(txn.id())).await;
        numbers
            .iter()
            .filter_map(|n| view.change_by_number(*n).map(|c| (c.key.clone(), *n)))
            .collect()
    };
    if targets.len() < numbers.len() {
        event!(
            Level::DEBUG,
            skipped = numbers.len() - targets.len(),
            "ignoring sent marks for retired change numbers"
        );
    }
    targets.sort();
    targets.dedup();

    let mut written = 0;
    for (key, change_number) in targets {
        db.lock_row(txn, change_lock(&key)).await?;
        let still_live = {
            let view = db.view(Some(txn.id())).await;
            let live = view
                .changes
                .get(&key, &view.snapshot)
                .is_some_and(|c| c.change_number == change_number);
            live && !view.is_sent(change_number)
        };
        if !still_live {
            continue;
        }

        let mark = SentMessage {
            change_number,
            object_id: key.object_id.clone(),
            object_type: key.object_type,
            timestamp: now_millis(),
        };
        db.storage()
            .write_sent(txn, change_number, Some(mark))
            .await?;
        written += 1;
    }

    event!(Level::DEBUG, written = written, "sent marks recorded");
    Ok(written)
}
