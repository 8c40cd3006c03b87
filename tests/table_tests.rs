//! Integration tests for table operations and their concurrency guarantees

use sowstore::storage::KeyIndex;
use sowstore::{
    JournalStorage, Key, MemoryStorage, MessageType, SowError, Table, TableOptions, TableState,
    TopicDefinition,
};
use std::sync::Arc;

fn bookmark_topic() -> TopicDefinition {
    TopicDefinition::new(
        "/amps/bookmarkStore",
        "./data/sow/bookmark.sow",
        MessageType::Json,
        &["/clientName", "/subId"],
    )
    .unwrap()
}

async fn open(storage: &MemoryStorage) -> Arc<Table> {
    Table::open(bookmark_topic(), Arc::new(storage.clone()), TableOptions::default())
        .await
        .unwrap()
}

fn message(client: &str, sub: &str, version: &str) -> Vec<u8> {
    format!(
        r#"{{"clientName":"{}","subId":"{}","payload":{{"v":"{}"}}}}"#,
        client, sub, version
    )
    .into_bytes()
}

#[tokio::test]
async fn test_worked_example_update_same_key() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;

    assert_eq!(table.put(&message("alice", "1", "v1")).await.unwrap(), 1);
    assert_eq!(table.put(&message("alice", "1", "v2")).await.unwrap(), 2);

    let record = table.get(&Key::from(["alice", "1"])).unwrap().unwrap();
    assert_eq!(record.data(), message("alice", "1", "v2").as_slice());

    let scanned: Vec<_> = table.scan().unwrap().collect();
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].key.to_string(), "{alice,1}");
}

#[tokio::test]
async fn test_worked_example_unwritable_storage() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    table.put(&message("bob", "7", "v1")).await.unwrap();

    storage.set_fail_writes(true);
    let err = table.put(&message("alice", "1", "v1")).await.unwrap_err();
    assert!(matches!(err, SowError::JournalWriteFailure(_)));
    assert!(!err.is_client_error());
    assert_eq!(table.state(), TableState::Degraded);

    let unrelated = table.get(&Key::from(["bob", "7"])).unwrap();
    assert!(unrelated.is_some());
    assert!(table.get(&Key::from(["alice", "1"])).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_put_does_not_come_back_after_restart() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    table.put(&message("alice", "1", "v1")).await.unwrap();

    // Every byte of the frame reaches storage before the error.
    storage.tear_next_append(usize::MAX);
    let err = table.put(&message("bob", "1", "v1")).await.unwrap_err();
    assert!(matches!(err, SowError::JournalWriteFailure(_)));
    assert_eq!(table.state(), TableState::Degraded);
    table.close().await.unwrap();

    let reopened = open(&storage).await;
    assert!(reopened.get(&Key::from(["bob", "1"])).unwrap().is_none());
    assert_eq!(reopened.last_sequence(), 1);
}

#[tokio::test]
async fn test_close_repairs_a_degraded_journal() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    table.put(&message("alice", "1", "v1")).await.unwrap();
    let committed = storage.segment_bytes(1).unwrap();

    // The append lands but can be neither synced nor cut back right away.
    storage.set_fail_after_append(true);
    let err = table.put(&message("bob", "1", "v1")).await.unwrap_err();
    assert!(matches!(err, SowError::JournalWriteFailure(_)));
    assert_eq!(table.state(), TableState::Degraded);
    assert!(storage.segment_bytes(1).unwrap().len() > committed.len());

    storage.set_fail_after_append(false);
    table.close().await.unwrap();
    assert_eq!(storage.segment_bytes(1).unwrap(), committed);

    let reopened = open(&storage).await;
    assert!(reopened.get(&Key::from(["bob", "1"])).unwrap().is_none());
    assert_eq!(reopened.last_sequence(), 1);
    assert_eq!(reopened.put(&message("bob", "1", "v2")).await.unwrap(), 2);
}

#[tokio::test]
async fn test_put_queued_behind_checkpoint_can_be_cancelled() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    for i in 0..50 {
        table.put(&message("a", &i.to_string(), "v")).await.unwrap();
    }
    let before = table.snapshot().unwrap();

    // Dropping a put at any point leaves either nothing or the whole write.
    let checkpoint = {
        let table = Arc::clone(&table);
        tokio::spawn(async move { table.checkpoint().await })
    };
    let cancelled = tokio::time::timeout(
        std::time::Duration::from_millis(0),
        table.put(&message("a", "0", "late")),
    )
    .await;
    checkpoint.await.unwrap().unwrap();

    let current = table.get(&Key::from(["a", "0"])).unwrap().unwrap();
    match cancelled {
        Ok(result) => {
            let sequence = result.unwrap();
            assert_eq!(table.last_sequence(), sequence);
            assert_eq!(current.data(), message("a", "0", "late").as_slice());
        }
        Err(_) => {
            assert_eq!(table.last_sequence(), 50);
            assert_eq!(table.snapshot().unwrap(), before);
        }
    }

    let live = table.snapshot().unwrap();
    let last = table.last_sequence();
    drop(table);
    let reopened = open(&storage).await;
    assert_eq!(reopened.snapshot().unwrap(), live);
    assert_eq!(reopened.last_sequence(), last);
}

#[tokio::test]
async fn test_round_trip_is_byte_identical() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;

    // Whitespace and field order are the caller's business.
    let raw = br#"  { "subId" : "9",  "clientName":"zoe", "n": [1, 2.5, null] }"#;
    table.put(raw).await.unwrap();
    let record = table.get(&Key::from(["zoe", "9"])).unwrap().unwrap();
    assert_eq!(record.data(), raw);
    assert_eq!(record.message_type, MessageType::Json);
}

#[tokio::test]
async fn test_delete_of_absent_key_changes_nothing() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    table.put(&message("alice", "1", "v1")).await.unwrap();

    let before_bytes = storage.segment_bytes(1).unwrap();
    let before_index = table.snapshot().unwrap();

    assert_eq!(table.delete(&Key::from(["nobody", "1"])).await.unwrap(), None);
    assert_eq!(table.delete(&Key::from(["nobody", "1"])).await.unwrap(), None);

    assert_eq!(storage.segment_bytes(1).unwrap(), before_bytes);
    assert_eq!(table.snapshot().unwrap(), before_index);
    assert_eq!(table.last_sequence(), 1);
}

#[tokio::test]
async fn test_concurrent_puts_to_one_key_follow_journal_order() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;

    let mut handles = Vec::new();
    for writer in 0..8 {
        let table = Arc::clone(&table);
        handles.push(tokio::spawn(async move {
            let mut sequences = Vec::new();
            for i in 0..25 {
                let version = format!("w{}-{}", writer, i);
                sequences.push((table.put(&message("alice", "1", &version)).await.unwrap(), version));
            }
            sequences
        }));
    }

    let mut committed = Vec::new();
    for handle in handles {
        committed.extend(handle.await.unwrap());
    }
    committed.sort();

    let sequences: Vec<u64> = committed.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, (1..=200).collect::<Vec<u64>>());

    // The surviving value is the one with the highest sequence.
    let (last_sequence, last_version) = committed.last().unwrap().clone();
    let current = table.get(&Key::from(["alice", "1"])).unwrap().unwrap();
    assert_eq!(current.data(), message("alice", "1", &last_version).as_slice());
    assert_eq!(table.last_sequence(), last_sequence);

    // A restarted table agrees with what readers saw.
    let live = table.snapshot().unwrap();
    drop(table);
    let reopened = open(&storage).await;
    assert_eq!(reopened.snapshot().unwrap(), live);
}

#[tokio::test]
async fn test_concurrent_distinct_keys() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;

    let puts = (0..50).map(|i| {
        let table = Arc::clone(&table);
        tokio::spawn(async move { table.put(&message("c", &i.to_string(), "v")).await })
    });
    for handle in puts.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(table.len(), 50);
    assert_eq!(table.last_sequence(), 50);
}

#[tokio::test]
async fn test_msgpack_topic() {
    let storage = MemoryStorage::new();
    let definition =
        TopicDefinition::new("orders", "orders.sow", MessageType::Msgpack, &["/id", "/venue"]).unwrap();
    let table = Table::open(definition, Arc::new(storage.clone()), TableOptions::default())
        .await
        .unwrap();

    let order = serde_json::json!({ "id": 42, "venue": "XNYS", "qty": 100 });
    let bytes = rmp_serde::to_vec_named(&order).unwrap();
    table.put(&bytes).await.unwrap();

    let key = Key::new(vec![42i64.into(), "XNYS".into()]);
    let record = table.get(&key).unwrap().unwrap();
    assert_eq!(record.data(), bytes.as_slice());
    assert_eq!(record.message_type, MessageType::Msgpack);

    let err = table.put(br#"{"id":1,"venue":"X"}"#).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_compact_removes_covered_segments() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    for i in 0..3 {
        table.put(&message("a", &i.to_string(), "v")).await.unwrap();
    }
    assert_eq!(table.checkpoint().await.unwrap(), 3);
    for i in 3..5 {
        table.put(&message("a", &i.to_string(), "v")).await.unwrap();
    }
    assert_eq!(storage.list_segments().unwrap(), vec![1, 4]);

    assert_eq!(table.compact().await.unwrap(), 2);
    assert!(storage.list_segments().unwrap().is_empty());
    assert!(storage.has_checkpoint());

    let live = table.snapshot().unwrap();
    table.put(&message("a", "5", "v")).await.unwrap();
    drop(table);

    let reopened = open(&storage).await;
    assert_eq!(reopened.last_sequence(), 6);
    assert_eq!(reopened.len(), live.len() + 1);
    assert_eq!(storage.list_segments().unwrap(), vec![6]);
}

#[tokio::test]
async fn test_snapshot_counts_match_scan() {
    let storage = MemoryStorage::new();
    let table = open(&storage).await;
    for client in ["carol", "alice", "bob"] {
        table.put(&message(client, "1", "v")).await.unwrap();
    }
    let snapshot: KeyIndex = table.snapshot().unwrap();
    let scan = table.scan().unwrap();
    assert_eq!(scan.len(), snapshot.len());
    let keys: Vec<String> = scan.map(|r| r.key.to_string()).collect();
    assert_eq!(keys, vec!["{alice,1}", "{bob,1}", "{carol,1}"]);
}
