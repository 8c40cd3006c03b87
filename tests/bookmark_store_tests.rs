//! Integration tests for the bookmark store over a configured, file backed topic

use sowstore::{BookmarkStore, EPOCH, ServerConfig, SowError, TableRegistry};
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let root = dir.path().display().to_string();
    let config = format!(
        r#"{{
            "name": "bookmark-server",
            "transports": [
                {{ "name": "json-tcp", "type": "tcp", "inet_addr": "127.0.0.1:9007", "protocol": "amps" }}
            ],
            "topics": [
                {{
                    "topic": "/amps/bookmarkStore",
                    "file_name": "{root}/sow/bookmark.sow",
                    "message_type": "json",
                    "keys": ["/clientName", "/subId"]
                }}
            ],
            "logging": [ {{ "protocol": "stdout", "level": "info" }} ],
            "transaction_log": {{
                "journal_directory": "{root}/journal",
                "topics": [ {{ "pattern": "/amps/.*", "message_type": "json" }} ],
                "checkpoint_every": 4
            }}
        }}"#
    );
    let path = dir.path().join("config.json");
    fs::write(&path, config).unwrap();
    path
}

#[tokio::test]
async fn test_bookmarks_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::from_file(write_config(&dir)).unwrap();

    let registry = TableRegistry::open(&config).await.unwrap();
    let table = registry.table("/amps/bookmarkStore").await.unwrap();
    let store = BookmarkStore::open(table, "haclient").unwrap();
    for i in 0..10 {
        store.discard("orders-sub", &format!("1000|{}|", i)).await.unwrap();
    }
    store.discard("fills-sub", "2000|1|").await.unwrap();
    registry.shutdown().await.unwrap();

    // The automatic checkpoint fired along the way.
    assert!(dir.path().join("sow/bookmark.sow").exists());
    assert!(dir.path().join("journal/amps_bookmarkStore").is_dir());

    let registry = TableRegistry::open(&config).await.unwrap();
    let table = registry.table("/amps/bookmarkStore").await.unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.last_sequence(), 11);

    let store = BookmarkStore::open(table, "haclient").unwrap();
    assert_eq!(store.most_recent("orders-sub").unwrap(), "1000|9|");
    assert_eq!(store.most_recent("fills-sub").unwrap(), "2000|1|");
    assert_eq!(store.most_recent("unknown").unwrap(), EPOCH);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_registry_refuses_bookmark_updates() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::from_file(write_config(&dir)).unwrap();

    let registry = TableRegistry::open(&config).await.unwrap();
    let table = registry.table("/amps/bookmarkStore").await.unwrap();
    let store = BookmarkStore::open(table, "haclient").unwrap();
    store.discard("s", "1").await.unwrap();
    registry.shutdown().await.unwrap();

    let err = store.discard("s", "2").await.unwrap_err();
    assert!(matches!(err, SowError::TableClosed(_)));
    assert_eq!(store.most_recent("s").unwrap(), "1");
}
