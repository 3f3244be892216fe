// ============================================================================
// Change Ledger
// ============================================================================
//
// Compacted change-number ledger and transactional outbox:
// - ChangeRecordStore: one live change per object, renumbered on replace
// - SentMessageTracker / ProcessedMessageTracker: delivery marks
// - UnsentMessageQueuer: set difference, optionally in change-number windows
// - Dispatcher: one publish pass over the unsent set
//
// ============================================================================

pub mod changes;
pub mod dispatch;
pub mod ordering;
pub mod partition;
pub mod processed;
pub mod record;
pub mod sent;
pub mod unsent;
pub mod validation;

pub use changes::ChangeRecordStore;
pub use dispatch::{DispatchReport, Dispatcher, MessagePublisher};
pub use ordering::{sort_by_change_number, sort_by_object_id};
pub use partition::{ChangeWindow, plan_windows};
pub use processed::ProcessedMessageTracker;
pub use record::{
    ChangeRecord, ChangeType, ObjectId, ObjectKey, ObjectType, ProcessedMessage, SentMessage,
    StoredChange,
};
pub use sent::SentMessageTracker;
pub use unsent::UnsentMessageQueuer;

use crate::core::Result;
use crate::facade::LedgerDb;
use crate::transaction::{LockKey, Transaction};

/// Row lock guarding a change row and the sent mark of its live number.
pub(crate) fn change_lock(key: &ObjectKey) -> LockKey {
    LockKey::new("CHANGES", key)
}

pub(crate) fn processed_lock(change_number: i64, queue_name: &str) -> LockKey {
    LockKey::new("PROCESSED_MESSAGES", format!("{}:{}", change_number, queue_name))
}

/// Removes the sent and processed marks of a retired change number.
///
/// The caller holds the change lock of the key that owned `change_number`.
pub(crate) async fn purge_marks(
    db: &LedgerDb,
    txn: &mut Transaction,
    change_number: i64,
) -> Result<()> {
    let (was_sent, queues) = {
        let view = db.view(Some(txn.id())).await;
        let queues: Vec<String> = view
            .processed
            .scan_ordinal_range(change_number..=change_number, &view.snapshot)
            .map(|row| row.queue_name.clone())
            .collect();
        (view.is_sent(change_number), queues)
    };

    if was_sent {
        db.storage().write_sent(txn, change_number, None).await?;
    }
    for queue_name in queues {
        db.lock_row(txn, processed_lock(change_number, &queue_name))
            .await?;
        db.storage()
            .write_processed(txn, (change_number, queue_name), None)
            .await?;
    }
    Ok(())
}
