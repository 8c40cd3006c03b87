use super::checkpoint::Checkpoint;
use super::engine::JournalStorage;
use super::index::KeyIndex;
use super::journal::{Journal, SegmentTail};
use crate::core::{Result, Sequence, SowError};
use std::time::Instant;
use tracing::{info, info_span};

/// Table contents rebuilt from checkpoint and journal.
#[derive(Debug)]
pub struct RecoveredState {
    pub index: KeyIndex,
    pub last_sequence: Sequence,
    pub checkpoint_sequence: Option<Sequence>,
    pub replayed: u64,
    pub tail: Option<SegmentTail>,
}

pub struct RecoveryManager<'a> {
    topic: &'a str,
    storage: &'a dyn JournalStorage,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(topic: &'a str, storage: &'a dyn JournalStorage) -> Self {
        Self { topic, storage }
    }

    /// Loads the checkpoint (if any) and replays every later journal entry
    /// through [`KeyIndex::apply`]. Any malformed or out-of-order entry fails
    /// the whole recovery.
    pub fn recover(&self, journal: &Journal) -> Result<RecoveredState> {
        let span = info_span!("recovery", topic = %self.topic);
        let _guard = span.enter();
        let started = Instant::now();

        let (mut index, checkpoint_sequence) = match Checkpoint::load(self.storage, self.topic)? {
            Some(checkpoint) => {
                let sequence = checkpoint.sequence;
                info!(sequence, records = checkpoint.records.len(), "checkpoint loaded");
                (checkpoint.into_index()?, Some(sequence))
            }
            None => (KeyIndex::new(), None),
        };

        let base = checkpoint_sequence.unwrap_or(0);
        let mut expected = base + 1;
        let mut reader = journal.read_from(expected)?;
        for entry in reader.by_ref() {
            let entry = entry?;
            if entry.sequence != expected {
                return Err(SowError::RecoveryCorruption(format!(
                    "journal resumes at sequence {}, expected {}",
                    entry.sequence, expected
                )));
            }
            index.apply(entry)?;
            expected += 1;
        }

        let last_sequence = expected - 1;
        let replayed = last_sequence - base;
        info!(
            records = index.len(),
            last_sequence,
            replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recovery complete"
        );

        Ok(RecoveredState {
            index,
            last_sequence,
            checkpoint_sequence,
            replayed,
            tail: reader.tail(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Key, MessageType, Operation, Record};
    use crate::storage::journal::{DurabilityMode, Mutation};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn put(journal: &mut Journal, index: &mut KeyIndex, client: &str, body: &str) {
        let key = Key::from([client, "1"]);
        let operation = if index.contains(&key) {
            Operation::Update
        } else {
            Operation::Insert
        };
        let record = Record::new(key, MessageType::Json, body.as_bytes().to_vec());
        let entry = journal.append(Mutation::upsert(operation, record)).unwrap();
        index.apply(entry).unwrap();
    }

    #[test]
    fn test_replay_from_empty() {
        let storage = MemoryStorage::new();
        let mut journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        journal.start_appending(0, None).unwrap();
        let mut live = KeyIndex::new();
        put(&mut journal, &mut live, "alice", "v1");
        put(&mut journal, &mut live, "bob", "v1");
        put(&mut journal, &mut live, "alice", "v2");

        let journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        let state = RecoveryManager::new("t", &storage).recover(&journal).unwrap();
        assert_eq!(state.index, live);
        assert_eq!(state.last_sequence, 3);
        assert_eq!(state.replayed, 3);
        assert_eq!(state.checkpoint_sequence, None);
    }

    #[test]
    fn test_checkpoint_plus_tail_replay() {
        let storage = MemoryStorage::new();
        let mut journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        journal.start_appending(0, None).unwrap();
        let mut live = KeyIndex::new();
        put(&mut journal, &mut live, "alice", "v1");
        put(&mut journal, &mut live, "bob", "v1");
        Checkpoint::capture("t", 2, &live).save(&storage).unwrap();
        journal.rotate().unwrap();
        put(&mut journal, &mut live, "alice", "v2");

        let journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        let state = RecoveryManager::new("t", &storage).recover(&journal).unwrap();
        assert_eq!(state.index, live);
        assert_eq!(state.checkpoint_sequence, Some(2));
        assert_eq!(state.replayed, 1);
        assert_eq!(state.tail.map(|t| t.base), Some(3));
    }

    #[test]
    fn test_missing_journal_prefix_is_corruption() {
        let storage = MemoryStorage::new();
        let mut journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        journal.start_appending(0, None).unwrap();
        let mut live = KeyIndex::new();
        put(&mut journal, &mut live, "alice", "v1");
        journal.rotate().unwrap();
        put(&mut journal, &mut live, "bob", "v1");
        storage.remove_segment(1).unwrap();

        let journal = Journal::open(Arc::new(storage.clone()), DurabilityMode::Sync).unwrap();
        let err = RecoveryManager::new("t", &storage).recover(&journal).unwrap_err();
        assert!(matches!(err, SowError::RecoveryCorruption(_)));
    }
}
