// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Transaction, TransactionId};
use crate::core::{READ_ONLY_TX, Snapshot};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub struct TransactionManager {
    next_id: AtomicU64,

    // Active transaction IDs, Copy-on-Write so snapshots are an Arc clone.
    active_ids: RwLock<Arc<HashSet<u64>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            // 0 marks rows restored from disk
            next_id: AtomicU64::new(1),
            active_ids: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    pub async fn begin(&self) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut active = self.active_ids.write().await;
        let mut new_set = (**active).clone();
        new_set.insert(id);
        *active = Arc::new(new_set);

        Transaction::new(TransactionId(id))
    }

    /// Snapshot for one statement of `txn_id`, or of a reader outside any
    /// transaction.
    pub async fn statement_snapshot(&self, txn_id: Option<TransactionId>) -> Snapshot {
        let active = self.active_ids.read().await.clone();
        Snapshot {
            tx_id: txn_id.map_or(READ_ONLY_TX, |id| id.0),
            active,
            max_tx_id: self.next_id.load(Ordering::SeqCst),
        }
    }

    /// Removes `txn_id` from the active set, making its writes visible to
    /// later snapshots (or, after undo, making it disappear).
    pub async fn finish(&self, txn_id: TransactionId) {
        let mut active = self.active_ids.write().await;
        if active.contains(&txn_id.0) {
            let mut new_set = (**active).clone();
            new_set.remove(&txn_id.0);
            *active = Arc::new(new_set);
        }
    }

    /// Versions expired by transactions older than this are dead to
    /// everyone.
    pub async fn horizon(&self) -> u64 {
        self.statement_snapshot(None).await.horizon()
    }

    pub async fn active_count(&self) -> usize {
        self.active_ids.read().await.len()
    }
}
