//! Unsent messages: live changes without a sent mark.

use super::partition::{ChangeWindow, plan_windows};
use super::record::{ChangeRecord, StoredChange};
use crate::connection::Connection;
use crate::core::{DbError, Result};
use crate::storage::LedgerView;
use chrono::{DateTime, Utc};
use tracing::{Instrument, Level, event, info_span};

/// Read-only queries over the difference between the CHANGES and
/// SENT_MESSAGES tables.
pub struct UnsentMessageQueuer<'c> {
    conn: &'c Connection,
}

impl<'c> UnsentMessageQueuer<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Up to `limit` unsent changes, ascending, from one scan of the whole
    /// table.
    pub async fn list_unsent_messages(&self, limit: i64) -> Result<Vec<ChangeRecord>> {
        let limit = check_limit(limit)?;
        let view = self.conn.view().await?;
        Ok(unsent_in(&view, .., None).take(limit).collect())
    }

    /// Unsent changes with `lower <= change_number <= upper`, ascending,
    /// optionally only those written at or before `older_than`.
    pub async fn list_unsent_messages_in_range(
        &self,
        lower: i64,
        upper: i64,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeRecord>> {
        let view = self.conn.view().await?;
        Ok(unsent_in(&view, lower..=upper, older_than).collect())
    }

    /// True when every live change in `[lower, upper]` has a sent mark.
    ///
    /// Compares row counts and the sum of CRC32 of the change numbers on
    /// both tables instead of joining them. An empty window is fully sent.
    pub async fn check_unsent_message_by_checksum_for_range(
        &self,
        lower: i64,
        upper: i64,
    ) -> Result<bool> {
        let view = self.conn.view().await?;
        Ok(window_fully_sent(&view, lower, upper))
    }

    /// Windows of about `unsent_window_size` rows covering the live
    /// change numbers.
    pub async fn plan_windows(&self) -> Result<Vec<ChangeWindow>> {
        let target = self.conn.db().config().unsent_window_size;
        let view = self.conn.view().await?;
        let (Some(min), Some(max)) = (
            view.changes.min_ordinal(&view.snapshot),
            view.changes.max_ordinal(&view.snapshot),
        ) else {
            return Ok(Vec::new());
        };
        let count = view.changes.estimated_len() as u64;
        Ok(plan_windows(min, max, count, target))
    }

    /// Up to `limit` unsent changes, ascending, scanning one window at a
    /// time and skipping windows whose checksum says they are fully sent.
    ///
    /// Each window is its own statement, so a concurrent writer may be
    /// seen in one window and not another; every change returned was
    /// unsent when its window was read.
    pub async fn list_unsent_messages_windowed(
        &self,
        limit: i64,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeRecord>> {
        let limit = check_limit(limit)?;
        let windows = self.plan_windows().await?;
        let span = info_span!("ledger.unsent_windowed", windows = windows.len(), limit = limit);

        async move {
            let mut unsent = Vec::new();
            let mut skipped = 0;
            for window in &windows {
                if unsent.len() >= limit {
                    break;
                }
                let view = self.conn.view().await?;
                if window_fully_sent(&view, window.lower, window.upper) {
                    skipped += 1;
                    continue;
                }
                unsent.extend(
                    unsent_in(&view, window.lower..=window.upper, older_than)
                        .take(limit - unsent.len()),
                );
            }
            event!(
                Level::DEBUG,
                found = unsent.len(),
                windows_skipped = skipped,
                "unsent scan finished"
            );
            Ok(unsent)
        }
        .instrument(span)
        .await
    }

    /// Number of live changes without a sent mark.
    pub async fn count_unsent(&self) -> Result<u64> {
        let view = self.conn.view().await?;
        Ok(unsent_in(&view, .., None).count() as u64)
    }
}

fn check_limit(limit: i64) -> Result<usize> {
    usize::try_from(limit)
        .map_err(|_| DbError::InvalidArgument("Limit cannot be less than zero".into()))
}

fn unsent_in<'v, B>(
    view: &'v LedgerView<'_>,
    range: B,
    older_than: Option<DateTime<Utc>>,
) -> impl Iterator<Item = ChangeRecord>
where
    B: std::ops::RangeBounds<i64>,
{
    view.changes
        .scan_ordinal_range(range, &view.snapshot)
        .filter(move |change| older_than.is_none_or(|cutoff| change.timestamp <= cutoff))
        .filter(move |change| !view.is_sent(change.change_number))
        .map(StoredChange::to_record)
}

fn window_fully_sent(view: &LedgerView<'_>, lower: i64, upper: i64) -> bool {
    let live = checksum(
        view.changes
            .scan_ordinal_range(lower..=upper, &view.snapshot)
            .map(|change| change.change_number),
    );
    let sent = checksum(
        view.sent
            .scan_ordinal_range(lower..=upper, &view.snapshot)
            .map(|mark| mark.change_number),
    );
    live == sent
}

/// Row count and wrapping sum of CRC32 over the decimal change numbers.
fn checksum(numbers: impl Iterator<Item = i64>) -> (u64, u64) {
    numbers.fold((0, 0), |(count, sum), number| {
        let crc = crc32fast::hash(number.to_string().as_bytes());
        (count + 1, sum.wrapping_add(u64::from(crc)))
    })
}
