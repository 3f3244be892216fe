use std::collections::HashSet;
use std::sync::Arc;

/// Transaction id carried by statements that run outside a transaction.
///
/// No row version is ever created under this id, so such readers only see
/// committed data.
pub const READ_ONLY_TX: u64 = u64::MAX;

/// Visibility horizon for one statement.
///
/// A row version is visible when its creating transaction is the reader
/// itself or committed before the snapshot was taken, and it has not been
/// expired by such a transaction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: Arc<HashSet<u64>>,
    pub max_tx_id: u64,
}

impl Snapshot {
    pub fn is_committed(&self, tx_id: u64) -> bool {
        if tx_id >= self.max_tx_id {
            return false;
        }
        !self.active.contains(&tx_id)
    }

    /// Oldest transaction id that may still need expired versions.
    pub fn horizon(&self) -> u64 {
        self.active
            .iter()
            .copied()
            .min()
            .unwrap_or(self.max_tx_id)
    }

    pub fn is_read_only(&self) -> bool {
        self.tx_id == READ_ONLY_TX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_excludes_active_and_future() {
        let snapshot = Snapshot {
            tx_id: 7,
            active: Arc::new([5u64].into_iter().collect()),
            max_tx_id: 8,
        };
        assert!(snapshot.is_committed(3));
        assert!(!snapshot.is_committed(5));
        assert!(!snapshot.is_committed(8));
        assert_eq!(snapshot.horizon(), 5);
        assert!(!snapshot.is_read_only());
    }

    #[test]
    fn test_horizon_without_active_transactions() {
        let snapshot = Snapshot {
            tx_id: READ_ONLY_TX,
            active: Arc::new(HashSet::new()),
            max_tx_id: 42,
        };
        assert_eq!(snapshot.horizon(), 42);
        assert!(snapshot.is_read_only());
        assert!(snapshot.is_committed(0));
    }
}
