use super::journal::JournalEntry;
use crate::core::{Key, Operation, Record, Result, Sequence, SowError};
use im::OrdMap;
use std::sync::Arc;

/// The latest committed version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub sequence: Sequence,
    pub record: Record,
}

/// In-memory map from key to latest record.
///
/// Backed by a persistent ordered map: clones are O(1) and isolated from
/// later mutation, which is what scans iterate over. Iteration is in key
/// order. Never the durability authority; rebuilt from checkpoint and journal
/// on open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyIndex {
    entries: OrdMap<Key, Arc<IndexedRecord>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &Key) -> Option<Arc<IndexedRecord>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn upsert(&mut self, key: Key, handle: Arc<IndexedRecord>) -> Option<Arc<IndexedRecord>> {
        self.entries.insert(key, handle)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Arc<IndexedRecord>> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Arc<IndexedRecord>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies one committed journal entry. Live writes and recovery both go
    /// through here. An entry that contradicts the current state (insert of a
    /// present key, update or delete of an absent one) is rejected.
    pub fn apply(&mut self, entry: JournalEntry) -> Result<()> {
        let JournalEntry {
            sequence,
            operation,
            key,
            payload,
            ..
        } = entry;
        let present = self.contains(&key);

        match (operation, payload) {
            (Operation::Insert, _) if present => Err(SowError::RecoveryCorruption(format!(
                "insert of existing key {} at sequence {}",
                key, sequence
            ))),
            (Operation::Update, _) if !present => Err(SowError::RecoveryCorruption(format!(
                "update of absent key {} at sequence {}",
                key, sequence
            ))),
            (Operation::Insert | Operation::Update, Some(record)) => {
                if record.key != key {
                    return Err(SowError::RecoveryCorruption(format!(
                        "payload key {} does not match entry key {} at sequence {}",
                        record.key, key, sequence
                    )));
                }
                self.upsert(key, Arc::new(IndexedRecord { sequence, record }));
                Ok(())
            }
            (Operation::Insert | Operation::Update, None) => Err(SowError::RecoveryCorruption(
                format!("{} without payload at sequence {}", operation, sequence),
            )),
            (Operation::Delete, _) => {
                if self.remove(&key).is_none() {
                    return Err(SowError::RecoveryCorruption(format!(
                        "delete of absent key {} at sequence {}",
                        key, sequence
                    )));
                }
                Ok(())
            }
        }
    }
}

impl FromIterator<(Key, Arc<IndexedRecord>)> for KeyIndex {
    fn from_iter<I: IntoIterator<Item = (Key, Arc<IndexedRecord>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for KeyIndex {
    type Item = (Key, Arc<IndexedRecord>);
    type IntoIter = Box<dyn Iterator<Item = (Key, Arc<IndexedRecord>)> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageType;

    fn entry(sequence: Sequence, operation: Operation, key: [&str; 2], body: &str) -> JournalEntry {
        let key = Key::from(key);
        let payload = (operation != Operation::Delete)
            .then(|| Record::new(key.clone(), MessageType::Json, body.as_bytes().to_vec()));
        JournalEntry {
            sequence,
            timestamp_ms: 0,
            operation,
            key,
            payload,
        }
    }

    #[test]
    fn test_apply_insert_update_delete() {
        let mut index = KeyIndex::new();
        index.apply(entry(1, Operation::Insert, ["alice", "1"], "v1")).unwrap();
        index.apply(entry(2, Operation::Update, ["alice", "1"], "v2")).unwrap();

        let current = index.lookup(&Key::from(["alice", "1"])).unwrap();
        assert_eq!(current.sequence, 2);
        assert_eq!(current.record.data(), b"v2");

        index.apply(entry(3, Operation::Delete, ["alice", "1"], "")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_apply_rejects_inconsistent_entries() {
        let mut index = KeyIndex::new();
        assert!(index.apply(entry(1, Operation::Update, ["a", "1"], "x")).is_err());
        assert!(index.apply(entry(1, Operation::Delete, ["a", "1"], "")).is_err());
        index.apply(entry(1, Operation::Insert, ["a", "1"], "x")).unwrap();
        assert!(index.apply(entry(2, Operation::Insert, ["a", "1"], "y")).is_err());
    }

    #[test]
    fn test_clone_is_isolated_snapshot() {
        let mut index = KeyIndex::new();
        index.apply(entry(1, Operation::Insert, ["a", "1"], "x")).unwrap();
        let snapshot = index.clone();
        index.apply(entry(2, Operation::Insert, ["b", "1"], "y")).unwrap();
        index.apply(entry(3, Operation::Delete, ["a", "1"], "")).unwrap();

        let keys: Vec<String> = snapshot.into_iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["{a,1}"]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_iteration_in_key_order() {
        let mut index = KeyIndex::new();
        for (seq, client) in [(1, "carol"), (2, "alice"), (3, "bob")] {
            index.apply(entry(seq, Operation::Insert, [client, "1"], "x")).unwrap();
        }
        let order: Vec<_> = index.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(order, vec!["{alice,1}", "{bob,1}", "{carol,1}"]);
    }
}
