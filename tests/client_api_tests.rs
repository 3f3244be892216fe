//! High-level client and configuration surface.

use changeledger::{
    ChangeRecord, ChangeType, DbError, DurabilityMode, LedgerClient, LedgerConfig, ObjectType,
};
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_config_url_round_trip() {
    let config = LedgerConfig::new()
        .data_dir("/var/lib/ledger")
        .durability(DurabilityMode::Sync)
        .unsent_window_size(5000)
        .lock_wait_timeout(Duration::from_millis(250))
        .checkpoint_threshold(64)
        .sequence_reserve_block(100)
        .max_connections(4);

    let url = config.to_url();
    assert!(url.starts_with("changeledger:///var/lib/ledger?"));

    let parsed = LedgerConfig::from_url(&url).unwrap();
    assert_eq!(parsed.data_dir, Some(PathBuf::from("/var/lib/ledger")));
    assert_eq!(parsed.durability, DurabilityMode::Sync);
    assert_eq!(parsed.unsent_window_size, 5000);
    assert_eq!(parsed.lock_wait_timeout, Duration::from_millis(250));
    assert_eq!(parsed.checkpoint_threshold, 64);
    assert_eq!(parsed.sequence_reserve_block, 100);
    assert_eq!(parsed.max_connections, 4);
}

#[test]
fn test_config_rejects_bad_values() {
    assert!(LedgerConfig::from_url("postgres://localhost/ledger").is_err());
    assert!(LedgerConfig::from_url("changeledger://?durability=sometimes").is_err());
    assert!(LedgerConfig::from_url("changeledger://?window=lots").is_err());

    assert!(LedgerConfig::new().unsent_window_size(0).validate().is_err());
    assert!(LedgerConfig::new().max_connections(0).validate().is_err());
    assert!(
        LedgerConfig::new()
            .lock_wait_timeout(Duration::ZERO)
            .validate()
            .is_err()
    );
    assert!(LedgerConfig::new().validate().is_ok());
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let result = LedgerClient::open(LedgerConfig::new().unsent_window_size(0)).await;
    assert!(matches!(result, Err(DbError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_clones_share_one_ledger() {
    let client = LedgerClient::in_memory().await.unwrap();
    let other = client.clone();

    client
        .replace_change(
            ChangeRecord::new("syn7", ObjectType::UserProfile, ChangeType::Create).with_etag("e"),
        )
        .await
        .unwrap();

    let seen = other.list_changes(0, None, 10).await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].object_type, Some(ObjectType::UserProfile));
}

#[tokio::test]
async fn test_close_returns_reset_connection() {
    let client = LedgerClient::in_memory().await.unwrap();
    let mut conn = client.connect().await.unwrap();
    let first_id = conn.id();

    conn.begin().await.unwrap();
    conn.close().await.unwrap();

    let stats = client.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.available_connections, 1);

    let conn = client.connect().await.unwrap();
    assert_eq!(conn.id(), first_id);
    assert!(!conn.is_in_transaction());
}

#[tokio::test]
async fn test_stats_reflect_ledger_contents() {
    let client = LedgerClient::in_memory().await.unwrap();
    client
        .replace_changes(vec![
            ChangeRecord::new("syn1", ObjectType::Entity, ChangeType::Create).with_etag("a"),
            ChangeRecord::new("syn2", ObjectType::Entity, ChangeType::Create).with_etag("a"),
        ])
        .await
        .unwrap();
    client.register_message_sent(1).await.unwrap();

    let stats = client.db().stats().await;
    assert_eq!(stats.changes, 2);
    assert_eq!(stats.sent_messages, 1);
    assert_eq!(stats.processed_messages, 0);
    assert_eq!(stats.next_change_number, 3);
    assert_eq!(stats.active_transactions, 0);
    assert!(!stats.persistent);
}
