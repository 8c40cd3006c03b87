//! Append-only transaction journal.
//!
//! Every committed mutation of a table becomes one checksummed frame in a
//! journal segment. Sequence numbers are assigned here, strictly increasing
//! and gap-free per table. Segments are never rewritten; a new one is started
//! after each checkpoint and old ones are only removed by an explicit purge.

use super::engine::{JournalStorage, SegmentWriter};
use super::frame::{self, FrameError};
use crate::core::{Key, Operation, Record, Result, Sequence, SowError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: Sequence,
    pub timestamp_ms: i64,
    pub operation: Operation,
    pub key: Key,
    /// Present for inserts and updates.
    pub payload: Option<Record>,
}

/// A mutation before the journal assigned it a sequence.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub operation: Operation,
    pub key: Key,
    pub payload: Option<Record>,
}

impl Mutation {
    pub fn upsert(operation: Operation, record: Record) -> Self {
        Self {
            operation,
            key: record.key.clone(),
            payload: Some(record),
        }
    }

    pub fn delete(key: Key) -> Self {
        Self {
            operation: Operation::Delete,
            key,
            payload: None,
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync every append before acknowledging it.
    #[default]
    Sync,
    /// Hand every append to the OS without fsync. Survives a process crash,
    /// not a power loss.
    Flush,
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Debug)]
struct ActiveSegment {
    base: Sequence,
    writer: Box<dyn SegmentWriter>,
    committed_len: u64,
}

/// Where the last segment's valid bytes end, as found by a full read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTail {
    pub base: Sequence,
    pub valid_len: u64,
    pub last_sequence: Option<Sequence>,
}

pub struct Journal {
    storage: Arc<dyn JournalStorage>,
    durability: DurabilityMode,
    segments: Vec<Sequence>,
    active: Option<ActiveSegment>,
    last_sequence: Sequence,
    max_frame_len: usize,
    healthy: bool,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("storage", &self.storage.describe())
            .field("segments", &self.segments)
            .field("last_sequence", &self.last_sequence)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl Journal {
    /// Opens the journal without reading it. Call [`Journal::read_from`] and
    /// then [`Journal::start_appending`] before the first append.
    pub fn open(storage: Arc<dyn JournalStorage>, durability: DurabilityMode) -> Result<Self> {
        let segments = storage.list_segments()?;
        debug!(storage = %storage.describe(), segments = segments.len(), "journal opened");
        Ok(Self {
            storage,
            durability,
            segments,
            active: None,
            last_sequence: 0,
            max_frame_len: frame::MAX_FRAME_LEN,
            healthy: true,
        })
    }

    /// Lowers the largest entry this journal will write. Readers always
    /// accept up to [`frame::MAX_FRAME_LEN`].
    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit.min(frame::MAX_FRAME_LEN);
        self
    }

    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    pub fn segments(&self) -> &[Sequence] {
        &self.segments
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Lazily reads entries with `sequence >= from`, ascending.
    pub fn read_from(&self, from: Sequence) -> Result<JournalReader> {
        let start = self
            .segments
            .iter()
            .rposition(|base| *base <= from)
            .unwrap_or(0);
        Ok(JournalReader::new(
            Arc::clone(&self.storage),
            self.segments[start..].iter().copied().collect(),
            from,
        ))
    }

    /// Positions the journal after recovery. The last segment is reused when
    /// it ends exactly at `last_sequence`, after cutting off any torn tail.
    pub fn start_appending(&mut self, last_sequence: Sequence, tail: Option<SegmentTail>) -> Result<()> {
        self.last_sequence = last_sequence;
        self.active = None;

        let Some(tail) = tail else {
            return Ok(());
        };
        if self.segments.last() != Some(&tail.base) {
            return Ok(());
        }
        let resumable = match tail.last_sequence {
            Some(last) => last == last_sequence,
            None => tail.base == last_sequence + 1,
        };
        if !resumable {
            info!(
                segment = tail.base,
                last_sequence, "journal tail does not end at the recovered sequence, starting a new segment"
            );
            return Ok(());
        }

        let mut writer = self.storage.segment_writer(tail.base)?;
        let len = writer.len()?;
        if len > tail.valid_len {
            warn!(
                segment = tail.base,
                valid_len = tail.valid_len,
                dropped = len - tail.valid_len,
                "truncating torn journal tail"
            );
            writer.truncate(tail.valid_len)?;
        }
        self.active = Some(ActiveSegment {
            base: tail.base,
            writer,
            committed_len: tail.valid_len,
        });
        Ok(())
    }

    /// Durably appends one mutation and returns the entry with its assigned
    /// sequence. An entry over the frame limit is refused before anything is
    /// written. A storage failure leaves the journal unhealthy; every later
    /// append fails until [`Journal::repair`] succeeds.
    pub fn append(&mut self, mutation: Mutation) -> Result<JournalEntry> {
        if !self.healthy {
            return Err(SowError::JournalWriteFailure(
                "journal is unhealthy after a failed write".to_string(),
            ));
        }

        let entry = JournalEntry {
            sequence: self.last_sequence + 1,
            timestamp_ms: Utc::now().timestamp_millis(),
            operation: mutation.operation,
            key: mutation.key,
            payload: mutation.payload,
        };
        let body = rmp_serde::to_vec(&entry).map_err(|e| {
            SowError::JournalWriteFailure(format!("Failed to serialize journal entry: {}", e))
        })?;
        let frame = frame::encode(&body, self.max_frame_len).map_err(|e| {
            SowError::MalformedRecord(format!("{} is too large to journal: {}", entry.key, e))
        })?;

        if let Err(err) = self.write_frame(entry.sequence, &frame) {
            self.healthy = false;
            error!(sequence = entry.sequence, error = %err, "journal append failed");
            self.discard_uncommitted();
            return Err(SowError::JournalWriteFailure(err.to_string()));
        }

        self.last_sequence = entry.sequence;
        Ok(entry)
    }

    fn write_frame(&mut self, sequence: Sequence, frame: &[u8]) -> Result<()> {
        if self.active.is_none() {
            let writer = self.storage.segment_writer(sequence)?;
            if self.segments.last() != Some(&sequence) {
                self.segments.push(sequence);
            }
            debug!(segment = sequence, "journal segment started");
            self.active = Some(ActiveSegment {
                base: sequence,
                writer,
                committed_len: 0,
            });
        }

        let durability = self.durability;
        let Some(active) = self.active.as_mut() else {
            return Err(SowError::JournalWriteFailure("no active segment".to_string()));
        };
        active.writer.append(frame)?;
        active.writer.flush()?;
        if durability == DurabilityMode::Sync {
            active.writer.sync()?;
        }
        active.committed_len += frame.len() as u64;
        Ok(())
    }

    /// Best effort cut of a failed append's bytes, so that a restart cannot
    /// replay an entry that was reported as failed. The journal stays
    /// unhealthy either way; [`Journal::repair`] retries the cut.
    fn discard_uncommitted(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let result = active
            .writer
            .truncate(active.committed_len)
            .and_then(|_| active.writer.sync());
        match result {
            Ok(()) => debug!(
                segment = active.base,
                committed_len = active.committed_len,
                "failed append discarded"
            ),
            Err(e) => warn!(
                segment = active.base,
                error = %e,
                "could not discard failed append, repair required"
            ),
        }
    }

    /// Cuts the active segment back to its last committed frame and marks
    /// the journal healthy again.
    pub fn repair(&mut self) -> Result<()> {
        if self.healthy {
            return Ok(());
        }
        if let Some(active) = self.active.as_mut() {
            active
                .writer
                .truncate(active.committed_len)
                .and_then(|_| active.writer.sync())
                .map_err(|e| SowError::JournalWriteFailure(format!("repair failed: {}", e)))?;
            if active.committed_len == 0 {
                // The failed append created this segment; let the next append
                // recreate it.
                let base = active.base;
                self.active = None;
                self.storage.remove_segment(base)?;
                self.segments.retain(|b| *b != base);
            }
        }
        self.healthy = true;
        info!(last_sequence = self.last_sequence, "journal repaired");
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(active) = self.active.as_mut() {
            active.writer.flush()?;
            active.writer.sync()?;
        }
        Ok(())
    }

    /// Closes the active segment so that the next append starts a new one.
    pub fn rotate(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.committed_len == 0 {
            return Ok(());
        }
        active.writer.flush()?;
        active.writer.sync()?;
        debug!(segment = active.base, "journal segment closed");
        self.active = None;
        Ok(())
    }

    /// Removes segments whose entries all have `sequence <= through`. The
    /// segment being appended to is always kept. Returns the number removed.
    pub fn purge_through(&mut self, through: Sequence) -> Result<usize> {
        let active_base = self.active.as_ref().map(|a| a.base);
        let mut removable: Vec<Sequence> = self
            .segments
            .windows(2)
            .filter(|pair| pair[1] - 1 <= through && Some(pair[0]) != active_base)
            .map(|pair| pair[0])
            .collect();
        if let Some(&last) = self.segments.last()
            && active_base.is_none()
            && self.last_sequence <= through
        {
            removable.push(last);
        }

        for base in &removable {
            self.storage.remove_segment(*base)?;
        }
        self.segments.retain(|base| !removable.contains(base));
        if !removable.is_empty() {
            info!(removed = removable.len(), through, "journal segments purged");
        }
        Ok(removable.len())
    }
}

// ============================================================================
// Reader
// ============================================================================

struct SegmentCursor {
    base: Sequence,
    reader: Box<dyn Read + Send>,
    offset: u64,
    last_sequence: Option<Sequence>,
    is_last: bool,
}

/// Lazy iterator over journal entries. Stops at the first error.
pub struct JournalReader {
    storage: Arc<dyn JournalStorage>,
    pending: VecDeque<Sequence>,
    current: Option<SegmentCursor>,
    from: Sequence,
    previous: Option<Sequence>,
    tail: Option<SegmentTail>,
    failed: bool,
}

impl JournalReader {
    fn new(storage: Arc<dyn JournalStorage>, pending: VecDeque<Sequence>, from: Sequence) -> Self {
        Self {
            storage,
            pending,
            current: None,
            from,
            previous: None,
            tail: None,
            failed: false,
        }
    }

    /// Valid extent of the last segment. Known once the iterator is exhausted.
    pub fn tail(&self) -> Option<SegmentTail> {
        self.tail
    }

    fn corrupt(&mut self, base: Sequence, msg: impl fmt::Display) -> Option<Result<JournalEntry>> {
        self.failed = true;
        Some(Err(SowError::RecoveryCorruption(format!(
            "journal segment {}: {}",
            base, msg
        ))))
    }

    fn open_next(&mut self) -> Result<bool> {
        let Some(base) = self.pending.pop_front() else {
            return Ok(false);
        };
        let reader = self.storage.open_segment(base)?;
        self.current = Some(SegmentCursor {
            base,
            reader,
            offset: 0,
            last_sequence: None,
            is_last: self.pending.is_empty(),
        });
        Ok(true)
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
            }
            let cursor = self.current.as_mut()?;
            let base = cursor.base;

            match frame::read(&mut *cursor.reader, frame::MAX_FRAME_LEN) {
                Ok(Some(body)) => {
                    let frame_len = (frame::FRAME_HEADER_LEN + body.len()) as u64;
                    let entry: JournalEntry = match rmp_serde::from_slice(&body) {
                        Ok(entry) => entry,
                        Err(e) => {
                            let offset = cursor.offset;
                            return self.corrupt(base, format!("undecodable entry at offset {}: {}", offset, e));
                        }
                    };

                    let expected = cursor.last_sequence.map_or(base, |last| last + 1);
                    if entry.sequence != expected {
                        return self.corrupt(
                            base,
                            format!("expected sequence {}, found {}", expected, entry.sequence),
                        );
                    }
                    if let Some(previous) = self.previous
                        && entry.sequence != previous + 1
                    {
                        return self.corrupt(
                            base,
                            format!("gap after sequence {}, found {}", previous, entry.sequence),
                        );
                    }
                    if entry.operation != Operation::Delete && entry.payload.is_none() {
                        return self.corrupt(base, format!("{} without payload at {}", entry.operation, entry.sequence));
                    }

                    cursor.offset += frame_len;
                    cursor.last_sequence = Some(entry.sequence);
                    self.previous = Some(entry.sequence);
                    if cursor.is_last {
                        self.tail = Some(SegmentTail {
                            base,
                            valid_len: cursor.offset,
                            last_sequence: cursor.last_sequence,
                        });
                    }
                    if entry.sequence < self.from {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => {
                    if cursor.is_last {
                        self.tail = Some(SegmentTail {
                            base,
                            valid_len: cursor.offset,
                            last_sequence: cursor.last_sequence,
                        });
                    }
                    self.current = None;
                }
                Err(FrameError::Torn) if cursor.is_last => {
                    warn!(segment = base, offset = cursor.offset, "torn frame at journal tail");
                    self.tail = Some(SegmentTail {
                        base,
                        valid_len: cursor.offset,
                        last_sequence: cursor.last_sequence,
                    });
                    self.current = None;
                }
                Err(FrameError::Torn) => {
                    let offset = cursor.offset;
                    return self.corrupt(base, format!("torn frame at offset {} in a sealed segment", offset));
                }
                Err(err @ (FrameError::Corrupt(_) | FrameError::TooLarge { .. })) => {
                    let offset = cursor.offset;
                    return self.corrupt(base, format!("offset {}: {}", offset, err));
                }
                Err(FrameError::Io(e)) => {
                    self.failed = true;
                    return Some(Err(SowError::IoError(format!(
                        "Failed to read journal segment {}: {}",
                        base, e
                    ))));
                }
            }
        }
    }
}
