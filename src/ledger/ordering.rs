//! Canonical ordering for batches of ledger writes.
//!
//! Every writer sorts its batch by object id before touching rows, so two
//! transactions that share keys always lock them in the same relative order
//! and can never wait on each other in a cycle.

use super::record::ChangeRecord;

/// Sorts changes by object id, then object type name.
///
/// Records missing either field sort first; validation rejects them before
/// any write, so their position never reaches storage.
pub fn sort_by_object_id(mut batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    batch.sort_by(|a, b| {
        a.object_id
            .cmp(&b.object_id)
            .then_with(|| a.object_type.cmp(&b.object_type))
    });
    batch
}

/// Sorts changes by their assigned change number.
pub fn sort_by_change_number(mut batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    batch.sort_by_key(|change| change.change_number);
    batch
}
