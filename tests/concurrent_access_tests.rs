//! Concurrent writers over overlapping keys.
//!
//! Run with: cargo test --test concurrent_access_tests

use changeledger::{ChangeRecord, ChangeType, LedgerClient, LedgerConfig, ObjectType};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn entity(id: String, etag: String) -> ChangeRecord {
    ChangeRecord::new(id, ObjectType::Entity, ChangeType::Update).with_etag(etag)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_batches_do_not_deadlock() {
    let client = LedgerClient::in_memory().await.unwrap();
    let num_tasks = 8;
    let rounds = 10;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for task_id in 0..num_tasks {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for round in 0..rounds {
                // Every task touches the same 20 keys, each in its own
                // shuffled order; even tasks walk them backwards.
                let mut batch: Vec<ChangeRecord> = (0..20)
                    .map(|i| entity(format!("syn{}", i), format!("t{}-r{}", task_id, round)))
                    .collect();
                if task_id % 2 == 0 {
                    batch.reverse();
                } else {
                    batch.rotate_left(round % 20);
                }
                client.replace_changes(batch).await.unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let changes = client.list_changes(0, None, 1000).await.unwrap();
    assert_eq!(changes.len(), 20);

    let mut conn = client.connect().await.unwrap();
    let current = conn.changes().get_current_change_number().await.unwrap();
    assert_eq!(current, (num_tasks * rounds * 20) as i64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_spam_keeps_one_row() {
    let client = LedgerClient::in_memory().await.unwrap();
    let num_tasks = 10;
    let writes_per_task = 25;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for task_id in 0..num_tasks {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut issued = Vec::with_capacity(writes_per_task);
            for i in 0..writes_per_task {
                let stored = client
                    .replace_change(entity("syn1".into(), format!("{}-{}", task_id, i)))
                    .await
                    .unwrap();
                issued.push(stored.change_number.unwrap());
            }
            issued
        }));
    }

    let mut all_numbers = HashSet::new();
    for handle in handles {
        let issued = handle.await.unwrap();
        // Each writer sees its own numbers grow.
        assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
        for n in issued {
            assert!(all_numbers.insert(n), "change number {} issued twice", n);
        }
    }
    assert_eq!(all_numbers.len(), num_tasks * writes_per_task);

    let live = client.list_changes(0, None, 100).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(
        live[0].change_number,
        all_numbers.iter().max().copied()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sent_marks_race_with_replace() {
    let client = LedgerClient::in_memory().await.unwrap();
    let keys = 30;
    let batch = (0..keys)
        .map(|i| entity(format!("syn{}", i), "v0".into()))
        .collect();
    client.replace_changes(batch).await.unwrap();

    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            for i in 0..keys {
                client
                    .replace_change(entity(format!("syn{}", i), "v1".into()))
                    .await
                    .unwrap();
            }
        })
    };

    let marker = {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            for n in 1..=keys as i64 {
                client.register_message_sent(n).await.unwrap();
            }
        })
    };

    writer.await.unwrap();
    marker.await.unwrap();

    // Every original number was retired, and its mark with it.
    let mut conn = client.connect().await.unwrap();
    for n in 1..=keys as i64 {
        assert!(!conn.sent_messages().is_sent(n).await.unwrap());
    }
    let unsent = conn.unsent().list_unsent_messages(1000).await.unwrap();
    assert_eq!(unsent.len(), keys);
    assert_eq!(client.db().stats().await.sent_messages, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_batches() {
    let client = LedgerClient::in_memory().await.unwrap();
    let batch_size = 10;
    let batches = 20;
    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            for b in 0..batches {
                let batch = (0..batch_size)
                    .map(|i| entity(format!("syn{}", b * batch_size + i), "e".into()))
                    .collect();
                client.replace_changes(batch).await.unwrap();
            }
        })
    };

    let reader = {
        let client = client.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            for _ in 0..100 {
                let seen = client.list_changes(0, None, 10_000).await.unwrap();
                assert_eq!(seen.len() % batch_size, 0, "saw {} rows", seen.len());
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
    assert_eq!(
        client.list_changes(0, None, 10_000).await.unwrap().len(),
        batch_size * batches
    );
}

#[tokio::test]
async fn test_pool_limits_connections() {
    let config = LedgerConfig::new()
        .max_connections(2)
        .connect_timeout(Duration::from_millis(100));
    let client = LedgerClient::open(config).await.unwrap();

    let first = client.connect().await.unwrap();
    let _second = client.connect().await.unwrap();
    assert!(client.connect().await.is_err());

    drop(first);
    let _third = client.connect().await.unwrap();
    assert_eq!(client.stats().await.total_connections, 2);
}
