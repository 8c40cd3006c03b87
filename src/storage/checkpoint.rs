use super::engine::JournalStorage;
use super::frame::{self, FrameError};
use super::index::{IndexedRecord, KeyIndex};
use crate::core::{Record, Result, Sequence, SowError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CHECKPOINT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub sequence: Sequence,
    pub record: Record,
}

/// Full image of a table as of `sequence`. Journal replay resumes at
/// `sequence + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u16,
    pub topic: String,
    pub sequence: Sequence,
    pub created_at_ms: i64,
    pub records: Vec<CheckpointRecord>,
}

impl Checkpoint {
    pub fn capture(topic: &str, sequence: Sequence, index: &KeyIndex) -> Self {
        let records = index
            .iter()
            .map(|(_, indexed)| CheckpointRecord {
                sequence: indexed.sequence,
                record: indexed.record.clone(),
            })
            .collect();

        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            topic: topic.to_string(),
            sequence,
            created_at_ms: Utc::now().timestamp_millis(),
            records,
        }
    }

    pub fn save(&self, storage: &dyn JournalStorage) -> Result<()> {
        let body = rmp_serde::to_vec(self)
            .map_err(|e| SowError::IoError(format!("Failed to serialize checkpoint: {}", e)))?;
        let frame = frame::encode(&body, frame::MAX_CHECKPOINT_LEN)
            .map_err(|e| SowError::IoError(format!("Failed to frame checkpoint: {}", e)))?;
        storage.write_checkpoint(&frame)
    }

    /// Loads the checkpoint for `topic`, if any. Anything unreadable is
    /// corruption: replaying without it could resurrect or lose records.
    pub fn load(storage: &dyn JournalStorage, topic: &str) -> Result<Option<Self>> {
        let Some(bytes) = storage.read_checkpoint()? else {
            return Ok(None);
        };

        let body = frame::decode_exact(&bytes, frame::MAX_CHECKPOINT_LEN).map_err(|e| match e {
            FrameError::Torn => SowError::RecoveryCorruption("checkpoint is truncated".to_string()),
            FrameError::Io(e) => SowError::IoError(e.to_string()),
            other => SowError::RecoveryCorruption(format!("checkpoint: {}", other)),
        })?;
        let checkpoint: Checkpoint = rmp_serde::from_slice(&body).map_err(|e| {
            SowError::RecoveryCorruption(format!("Failed to deserialize checkpoint: {}", e))
        })?;

        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(SowError::RecoveryCorruption(format!(
                "unsupported checkpoint format version {}",
                checkpoint.format_version
            )));
        }
        if checkpoint.topic != topic {
            return Err(SowError::RecoveryCorruption(format!(
                "checkpoint belongs to topic '{}', expected '{}'",
                checkpoint.topic, topic
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Rebuilds the index, rejecting duplicate keys and records newer than
    /// the checkpoint itself.
    pub fn into_index(self) -> Result<KeyIndex> {
        let mut index = KeyIndex::new();
        for CheckpointRecord { sequence, record } in self.records {
            if sequence > self.sequence {
                return Err(SowError::RecoveryCorruption(format!(
                    "checkpoint at {} holds record {} from sequence {}",
                    self.sequence, record.key, sequence
                )));
            }
            let key = record.key.clone();
            if index
                .upsert(key.clone(), Arc::new(IndexedRecord { sequence, record }))
                .is_some()
            {
                return Err(SowError::RecoveryCorruption(format!(
                    "checkpoint holds key {} twice",
                    key
                )));
            }
        }
        Ok(index)
    }
}
