// ============================================================================
// ChangeLedger Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod facade;
pub mod ledger;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use core::{DbError, Result};
pub use facade::{LedgerDb, LedgerStats};
pub use storage::DurabilityMode;

// Re-export connection API
pub use connection::{
    Connection,
    config::LedgerConfig,
    pool::{ConnectionPool, PoolGuard, PoolStats},
};

// Re-export the ledger API
pub use ledger::{
    ChangeRecord, ChangeRecordStore, ChangeType, ChangeWindow, DispatchReport, Dispatcher,
    MessagePublisher, ObjectId, ObjectKey, ObjectType, ProcessedMessageTracker,
    SentMessageTracker, UnsentMessageQueuer, sort_by_change_number, sort_by_object_id,
};

use std::sync::Arc;

// ============================================================================
// High-level Client API
// ============================================================================

/// Ledger client with connection pooling
///
/// This is the recommended way to use the ledger in applications. Cloning
/// is cheap; clones share the pool and the ledger.
///
/// # Examples
///
/// ```
/// use changeledger::{ChangeRecord, ChangeType, LedgerClient, ObjectType};
///
/// # tokio_test::block_on(async {
/// let client = LedgerClient::in_memory().await.unwrap();
///
/// let stored = client
///     .replace_change(
///         ChangeRecord::new("syn123", ObjectType::Entity, ChangeType::Create).with_etag("e1"),
///     )
///     .await
///     .unwrap();
/// assert_eq!(stored.change_number, Some(1));
///
/// let unsent = client.list_unsent_messages(10).await.unwrap();
/// assert_eq!(unsent.len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct LedgerClient {
    pool: Arc<ConnectionPool>,
}

impl LedgerClient {
    /// Open a ledger with the given configuration
    pub async fn open(config: LedgerConfig) -> Result<Self> {
        let db = LedgerDb::open(config).await?;
        Ok(Self::from_db(db))
    }

    /// Open a memory-only ledger with default settings
    pub async fn in_memory() -> Result<Self> {
        Self::open(LedgerConfig::default()).await
    }

    /// Open using a connection string
    ///
    /// Format: `changeledger://[/data/dir][?durability=sync&window=5000]`
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::open(LedgerConfig::from_url(url)?).await
    }

    pub fn from_db(db: Arc<LedgerDb>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(db)),
        }
    }

    /// Get a connection from the pool
    ///
    /// Use this when you need transaction support or multiple operations
    /// on the same connection.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let mut conn = client.connect().await?;
    ///
    /// conn.begin().await?;
    /// conn.changes().replace_change(first).await?;
    /// conn.sent_messages().register_message_sent(7).await?;
    /// conn.commit().await?;
    /// ```
    pub async fn connect(&self) -> Result<PoolGuard> {
        self.pool.get_connection().await
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        self.pool.db()
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub fn dispatcher<P: MessagePublisher>(&self, publisher: P) -> Dispatcher<P> {
        Dispatcher::new(self.clone(), publisher)
    }

    /// Replace one change on a pooled connection
    pub async fn replace_change(&self, change: ChangeRecord) -> Result<ChangeRecord> {
        let mut conn = self.connect().await?;
        let stored = conn.changes().replace_change(change).await;
        conn.close().await?;
        stored
    }

    /// Replace a batch of changes atomically on a pooled connection
    pub async fn replace_changes(&self, batch: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>> {
        let mut conn = self.connect().await?;
        let stored = conn.changes().replace_changes(batch).await;
        conn.close().await?;
        stored
    }

    pub async fn list_changes(
        &self,
        min_change_number: i64,
        object_type: Option<ObjectType>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>> {
        let mut conn = self.connect().await?;
        let listed = conn
            .changes()
            .list_changes(min_change_number, object_type, limit)
            .await;
        conn.close().await?;
        listed
    }

    pub async fn list_unsent_messages(&self, limit: i64) -> Result<Vec<ChangeRecord>> {
        let conn = self.connect().await?;
        let unsent = conn.unsent().list_unsent_messages(limit).await;
        conn.close().await?;
        unsent
    }

    pub async fn register_message_sent(&self, change_number: i64) -> Result<bool> {
        let mut conn = self.connect().await?;
        let written = conn.sent_messages().register_message_sent(change_number).await;
        conn.close().await?;
        written
    }
}
