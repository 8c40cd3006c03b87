//! Subscription bookmark tracking on top of a bookmark store table.
//!
//! One record per `(clientName, subId)` holds the last bookmark the tracked
//! client finished processing. Messages are assumed to be discarded strictly
//! in arrival order, so the newest bookmark per subscription is all that
//! needs remembering.

use crate::codec::Document;
use crate::core::{Key, KeyValue, MessageType, Result, Sequence, SowError};
use crate::storage::Table;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Bookmark returned for subscriptions with no recorded progress: replay
/// from the beginning of the transaction log.
pub const EPOCH: &str = "0";

const CLIENT_NAME_FIELD: &str = "clientName";
const SUB_ID_FIELD: &str = "subId";
const BOOKMARK_FIELD: &str = "bookmark";

#[derive(Debug)]
pub struct BookmarkStore {
    table: Arc<Table>,
    tracked_client: String,
    /// Orders publishes so the cache follows journal order.
    publish: Mutex<()>,
    most_recent: RwLock<HashMap<String, String>>,
}

impl BookmarkStore {
    /// Loads the most recent bookmark of every subscription of
    /// `tracked_client` from `table`.
    pub fn open(table: Arc<Table>, tracked_client: &str) -> Result<Self> {
        check_layout(&table)?;

        let mut most_recent = HashMap::new();
        for record in table.scan()? {
            let document = table.codec().decode(record.data())?;
            if document.get(CLIENT_NAME_FIELD).and_then(Document::as_str) != Some(tracked_client) {
                continue;
            }
            let sub_id = document.get(SUB_ID_FIELD).and_then(Document::as_str);
            let bookmark = document.get(BOOKMARK_FIELD).and_then(Document::as_str);
            if let (Some(sub_id), Some(bookmark)) = (sub_id, bookmark) {
                most_recent.insert(sub_id.to_string(), bookmark.to_string());
            }
        }

        info!(
            topic = %table.topic(),
            client = tracked_client,
            subscriptions = most_recent.len(),
            "bookmark store loaded"
        );
        Ok(Self {
            table,
            tracked_client: tracked_client.to_string(),
            publish: Mutex::new(()),
            most_recent: RwLock::new(most_recent),
        })
    }

    pub fn tracked_client(&self) -> &str {
        &self.tracked_client
    }

    /// The bookmark to resubscribe from, or [`EPOCH`].
    pub fn most_recent(&self, sub_id: &str) -> Result<String> {
        Ok(self
            .most_recent
            .read()?
            .get(sub_id)
            .cloned()
            .unwrap_or_else(|| EPOCH.to_string()))
    }

    /// Always false: with in-order discards no delivered message can already
    /// have been discarded.
    pub fn is_discarded(&self, _sub_id: &str, _bookmark: &str) -> bool {
        false
    }

    /// Records `bookmark` as processed for `sub_id`. The cached value only
    /// changes once the table has made the update durable.
    pub async fn discard(&self, sub_id: &str, bookmark: &str) -> Result<Sequence> {
        let payload = json!({
            CLIENT_NAME_FIELD: self.tracked_client,
            SUB_ID_FIELD: sub_id,
            BOOKMARK_FIELD: bookmark,
        });
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| SowError::MalformedRecord(format!("Failed to encode bookmark: {}", e)))?;

        let _order = self.publish.lock().await;
        let sequence = self.table.put(&bytes).await?;
        self.most_recent
            .write()?
            .insert(sub_id.to_string(), bookmark.to_string());
        debug!(sub_id, bookmark, sequence, "bookmark discarded");
        Ok(sequence)
    }

    /// Drops all progress for `sub_id`. Returns whether anything was stored.
    pub async fn forget(&self, sub_id: &str) -> Result<bool> {
        let key = Key::new(vec![
            KeyValue::Text(self.tracked_client.clone()),
            KeyValue::Text(sub_id.to_string()),
        ]);

        let _order = self.publish.lock().await;
        let deleted = self.table.delete(&key).await?.is_some();
        self.most_recent.write()?.remove(sub_id);
        Ok(deleted)
    }

    /// Subscriptions with recorded progress, sorted.
    pub fn subscriptions(&self) -> Result<Vec<String>> {
        let mut subs: Vec<String> = self.most_recent.read()?.keys().cloned().collect();
        subs.sort();
        Ok(subs)
    }
}

fn check_layout(table: &Table) -> Result<()> {
    let definition = table.definition();
    if definition.message_type != MessageType::Json {
        return Err(SowError::ConfigError(format!(
            "bookmark topic '{}' must use json messages, not {}",
            definition.topic, definition.message_type
        )));
    }
    let keys: Vec<&str> = definition.keys.iter().map(|k| k.as_str()).collect();
    let expected = [format!("/{}", CLIENT_NAME_FIELD), format!("/{}", SUB_ID_FIELD)];
    if keys != expected.iter().map(String::as_str).collect::<Vec<_>>() {
        return Err(SowError::ConfigError(format!(
            "bookmark topic '{}' must be keyed by {} and {}, found {:?}",
            definition.topic, expected[0], expected[1], keys
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicDefinition;
    use crate::storage::{MemoryStorage, TableOptions};

    async fn table(storage: &MemoryStorage) -> Arc<Table> {
        let definition = TopicDefinition::new(
            "/amps/bookmarkStore",
            "bookmark.sow",
            MessageType::Json,
            &["/clientName", "/subId"],
        )
        .unwrap();
        Table::open(definition, Arc::new(storage.clone()), TableOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_subscription_starts_at_epoch() {
        let storage = MemoryStorage::new();
        let store = BookmarkStore::open(table(&storage).await, "haclient").unwrap();
        assert_eq!(store.most_recent("sub-1").unwrap(), EPOCH);
        assert!(!store.is_discarded("sub-1", "123|456|"));
    }

    #[tokio::test]
    async fn test_discard_survives_reopen_and_ignores_other_clients() {
        let storage = MemoryStorage::new();
        let store = BookmarkStore::open(table(&storage).await, "haclient").unwrap();
        store.discard("sub-1", "b1").await.unwrap();
        store.discard("sub-1", "b2").await.unwrap();
        store.discard("sub-2", "c1").await.unwrap();

        let other = BookmarkStore::open(store.table.clone(), "other").unwrap();
        other.discard("sub-1", "x9").await.unwrap();
        drop(store);
        drop(other);

        let reopened = BookmarkStore::open(table(&storage).await, "haclient").unwrap();
        assert_eq!(reopened.most_recent("sub-1").unwrap(), "b2");
        assert_eq!(reopened.most_recent("sub-2").unwrap(), "c1");
        assert_eq!(reopened.subscriptions().unwrap(), vec!["sub-1", "sub-2"]);
    }

    #[tokio::test]
    async fn test_failed_discard_keeps_previous_bookmark() {
        let storage = MemoryStorage::new();
        let store = BookmarkStore::open(table(&storage).await, "haclient").unwrap();
        store.discard("sub-1", "b1").await.unwrap();

        storage.set_fail_writes(true);
        assert!(store.discard("sub-1", "b2").await.is_err());
        assert_eq!(store.most_recent("sub-1").unwrap(), "b1");
    }

    #[tokio::test]
    async fn test_forget() {
        let storage = MemoryStorage::new();
        let store = BookmarkStore::open(table(&storage).await, "haclient").unwrap();
        store.discard("sub-1", "b1").await.unwrap();

        assert!(store.forget("sub-1").await.unwrap());
        assert!(!store.forget("sub-1").await.unwrap());
        assert_eq!(store.most_recent("sub-1").unwrap(), EPOCH);
    }

    #[tokio::test]
    async fn test_rejects_wrongly_keyed_topic() {
        let definition =
            TopicDefinition::new("orders", "orders.sow", MessageType::Json, &["/id"]).unwrap();
        let table = Table::open(
            definition,
            Arc::new(MemoryStorage::new()),
            TableOptions::default(),
        )
        .await
        .unwrap();
        assert!(matches!(
            BookmarkStore::open(table, "haclient"),
            Err(SowError::ConfigError(_))
        ));
    }
}
