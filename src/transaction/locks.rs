// ============================================================================
// Row Lock Manager
// ============================================================================
//
// Exclusive row locks held until commit or rollback. Waiters are tracked in
// a wait-for graph; a request that would close a cycle fails immediately
// with `DbError::Deadlock` instead of blocking.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Level, event};

/// Identity of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    table: &'static str,
    row: String,
}

impl LockKey {
    pub fn new(table: &'static str, row: impl fmt::Display) -> Self {
        Self {
            table,
            row: row.to_string(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.table, self.row)
    }
}

#[derive(Debug, Default)]
struct LockTable {
    owners: HashMap<LockKey, u64>,
    held: HashMap<u64, Vec<LockKey>>,
    waits_for: HashMap<u64, u64>,
}

impl LockTable {
    /// Would `waiter` waiting on `owner` close a cycle?
    fn closes_cycle(&self, waiter: u64, owner: u64) -> bool {
        let mut seen = HashSet::new();
        let mut current = owner;
        loop {
            if current == waiter {
                return true;
            }
            if !seen.insert(current) {
                return false;
            }
            match self.waits_for.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
    }

    fn grant(&mut self, tx_id: u64, key: LockKey) {
        self.waits_for.remove(&tx_id);
        self.held.entry(tx_id).or_default().push(key.clone());
        self.owners.insert(key, tx_id);
    }
}

pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
    wait_timeout: Duration,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            wait_timeout,
        }
    }

    /// Blocks until `tx_id` owns `key`. Re-acquiring a held lock is free.
    pub async fn acquire(&self, tx_id: u64, key: LockKey) -> Result<()> {
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut table = self.table.lock()?;
                match table.owners.get(&key).copied() {
                    None => {
                        table.grant(tx_id, key);
                        return Ok(());
                    }
                    Some(owner) if owner == tx_id => {
                        table.waits_for.remove(&tx_id);
                        return Ok(());
                    }
                    Some(owner) => {
                        if table.closes_cycle(tx_id, owner) {
                            table.waits_for.remove(&tx_id);
                            event!(
                                Level::WARN,
                                tx_id = tx_id,
                                owner = owner,
                                lock = %key,
                                "deadlock victim chosen"
                            );
                            return Err(DbError::Deadlock(format!(
                                "transaction {} waiting for {} held by transaction {}",
                                tx_id, key, owner
                            )));
                        }
                        table.waits_for.insert(tx_id, owner);
                    }
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                self.table.lock()?.waits_for.remove(&tx_id);
                event!(Level::WARN, tx_id = tx_id, lock = %key, "lock wait timed out");
                return Err(DbError::LockTimeout(format!(
                    "transaction {} waited {:?} for {}",
                    tx_id, self.wait_timeout, key
                )));
            }
        }
    }

    /// Drops every lock owned by `tx_id` and wakes all waiters.
    pub fn release_all(&self, tx_id: u64) -> Result<usize> {
        let released = {
            let mut table = self.table.lock()?;
            table.waits_for.remove(&tx_id);
            let keys = table.held.remove(&tx_id).unwrap_or_default();
            for key in &keys {
                table.owners.remove(key);
            }
            keys.len()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
        Ok(released)
    }

    pub fn held_by(&self, tx_id: u64) -> Result<usize> {
        Ok(self.table.lock()?.held.get(&tx_id).map_or(0, Vec::len))
    }

    pub fn owner_of(&self, key: &LockKey) -> Result<Option<u64>> {
        Ok(self.table.lock()?.owners.get(key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(row: u32) -> LockKey {
        LockKey::new("CHANGES", row)
    }

    #[tokio::test]
    async fn test_reacquire_is_free() {
        let locks = LockManager::new(Duration::from_millis(50));
        locks.acquire(1, key(1)).await.unwrap();
        locks.acquire(1, key(1)).await.unwrap();
        assert_eq!(locks.held_by(1).unwrap(), 1);
        assert_eq!(locks.release_all(1).unwrap(), 1);
        assert_eq!(locks.owner_of(&key(1)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let locks = LockManager::new(Duration::from_millis(30));
        locks.acquire(1, key(1)).await.unwrap();
        let err = locks.acquire(2, key(1)).await.unwrap_err();
        assert!(matches!(err, DbError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(1, key(1)).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(2, key(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release_all(1).unwrap();

        waiter.await.unwrap().unwrap();
        assert_eq!(locks.owner_of(&key(1)).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_cycle_is_detected() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(1, key(1)).await.unwrap();
        locks.acquire(2, key(2)).await.unwrap();

        let first = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(1, key(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = locks.acquire(2, key(1)).await.unwrap_err();
        assert!(matches!(err, DbError::Deadlock(_)));

        locks.release_all(2).unwrap();
        first.await.unwrap().unwrap();
    }
}
