use super::Connection;
use crate::core::{DbError, Result};
use crate::facade::LedgerDb;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Connection pool
///
/// Hands out connections over one shared [`LedgerDb`], up to
/// `max_connections` at a time.
pub struct ConnectionPool {
    /// Available connections
    available: Arc<Mutex<VecDeque<Connection>>>,
    /// Total number of connections created
    total_connections: Arc<AtomicUsize>,
    db: Arc<LedgerDb>,
    next_id: AtomicU64,
    max_connections: usize,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        let config = db.config();
        Self {
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout,
            db,
        }
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if let Some(connection) = self.available.lock().await.pop_front() {
                return Ok(self.guard(connection));
            }

            if let Some(connection) = self.try_create_connection() {
                return Ok(self.guard(connection));
            }

            if start.elapsed() > self.connect_timeout {
                event!(
                    Level::WARN,
                    max_connections = self.max_connections,
                    "connection pool exhausted"
                );
                return Err(DbError::ExecutionError(
                    "Connection pool timeout: no connections available".into(),
                ));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, connection: Connection) -> PoolGuard {
        PoolGuard {
            connection,
            pool: Arc::clone(&self.available),
            total_connections: Arc::clone(&self.total_connections),
        }
    }

    /// Try to create a new connection if under limit
    fn try_create_connection(&self) -> Option<Connection> {
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.max_connections).then_some(total + 1)
            });
        if reserved.is_err() {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event!(Level::DEBUG, connection = id, "connection opened");
        Some(Connection::new(id, Arc::clone(&self.db)))
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.max_connections,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped. A connection dropped
/// with an open transaction is discarded and its transaction rolled back
/// in the background; `close` does the same synchronously.
pub struct PoolGuard {
    connection: Connection,
    pool: Arc<Mutex<VecDeque<Connection>>>,
    total_connections: Arc<AtomicUsize>,
}

impl PoolGuard {
    /// Roll back any open transaction and return the connection to the pool.
    pub async fn close(mut self) -> Result<()> {
        let mut connection = self.detach();
        if !connection.is_active() {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }
        if let Err(err) = connection.reset().await {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        self.pool.lock().await.push_back(connection);
        Ok(())
    }

    /// Swaps in a closed placeholder so `Drop` has nothing left to return.
    fn detach(&mut self) -> Connection {
        let placeholder = Connection {
            id: 0,
            db: Arc::clone(&self.connection.db),
            state: super::ConnectionState::Closed,
            transaction: None,
        };
        std::mem::replace(&mut self.connection, placeholder)
    }
}

impl Deref for PoolGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if self.connection.id == 0 {
            return;
        }
        let connection = self.detach();

        if connection.transaction.is_some() || !connection.is_active() {
            if connection.transaction.is_some() {
                event!(
                    Level::WARN,
                    connection = connection.id,
                    "pooled connection dropped with an open transaction"
                );
            }
            // Drop of the connection itself rolls the transaction back.
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match self.pool.try_lock() {
            Ok(mut pool) => pool.push_back(connection),
            Err(_) => {
                event!(
                    Level::DEBUG,
                    connection = connection.id,
                    "pool busy, connection discarded"
                );
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
