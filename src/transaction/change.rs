// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Every row write made inside a transaction is recorded as a `Change`. The
// log is replayed newest-first to undo a rollback or savepoint, and turned
// into redo operations for the WAL at commit.
//
// ============================================================================

use crate::ledger::record::{ObjectKey, ProcessedMessage, SentMessage, StoredChange};
use crate::storage::persistence::WalOp;
use crate::storage::table::WriteOutcome;

#[derive(Debug, Clone)]
pub enum Change {
    /// Row of the CHANGES table written; `row` is the new head or `None`
    /// for a delete.
    ChangeRow {
        key: ObjectKey,
        row: Option<StoredChange>,
        outcome: WriteOutcome,
    },

    SentRow {
        change_number: i64,
        row: Option<SentMessage>,
        outcome: WriteOutcome,
    },

    ProcessedRow {
        key: (i64, String),
        row: Option<ProcessedMessage>,
        outcome: WriteOutcome,
    },
}

impl Change {
    pub fn table_name(&self) -> &'static str {
        match self {
            Change::ChangeRow { .. } => "CHANGES",
            Change::SentRow { .. } => "SENT_MESSAGES",
            Change::ProcessedRow { .. } => "PROCESSED_MESSAGES",
        }
    }

    pub fn outcome(&self) -> WriteOutcome {
        match self {
            Change::ChangeRow { outcome, .. }
            | Change::SentRow { outcome, .. }
            | Change::ProcessedRow { outcome, .. } => *outcome,
        }
    }

    /// True when the write touched nothing, e.g. deleting an absent row.
    pub fn is_noop(&self) -> bool {
        let outcome = self.outcome();
        !outcome.created && !outcome.expired
    }

    /// Redo operation for the WAL, if the write had any effect.
    pub fn redo(&self) -> Option<WalOp> {
        if self.is_noop() {
            return None;
        }
        let op = match self {
            Change::ChangeRow { key, row, .. } => match row {
                Some(row) => WalOp::PutChange(row.clone()),
                None => WalOp::RemoveChange(key.clone()),
            },
            Change::SentRow {
                change_number, row, ..
            } => match row {
                Some(row) => WalOp::PutSent(row.clone()),
                None => WalOp::RemoveSent(*change_number),
            },
            Change::ProcessedRow { key, row, .. } => match row {
                Some(row) => WalOp::PutProcessed(row.clone()),
                None => WalOp::RemoveProcessed {
                    change_number: key.0,
                    queue_name: key.1.clone(),
                },
            },
        };
        Some(op)
    }
}
