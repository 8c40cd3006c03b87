//! The keyed state-of-the-world table.
//!
//! Writers funnel through one async lock that owns the journal: the presence
//! check, the durable append and the index update all happen under it, with
//! no await point between append and apply. A cancelled write therefore
//! either never reached the journal or is fully applied, and the index always
//! reflects journal order. Readers only take a short lock on the in-memory
//! view and never wait for journal I/O.

use super::checkpoint::Checkpoint;
use super::engine::JournalStorage;
use super::frame;
use super::index::KeyIndex;
use super::journal::{DurabilityMode, Journal, Mutation};
use super::recovery::RecoveryManager;
use crate::codec::{RecordCodec, codec_for};
use crate::config::TopicDefinition;
use crate::core::{Key, Operation, Record, Result, Sequence, SowError, TableState};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Largest record a table accepts by default. Half a journal frame leaves
/// room for the key, which is also stored outside the record bytes.
pub const MAX_RECORD_LEN: usize = frame::MAX_FRAME_LEN / 2;

#[derive(Debug, Clone)]
pub struct TableOptions {
    pub durability: DurabilityMode,
    /// Write a checkpoint after this many mutations.
    pub checkpoint_every: Option<u64>,
    pub checkpoint_on_close: bool,
    pub max_record_len: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            checkpoint_every: None,
            checkpoint_on_close: false,
            max_record_len: MAX_RECORD_LEN,
        }
    }
}

impl TableOptions {
    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn checkpoint_every(mut self, mutations: u64) -> Self {
        self.checkpoint_every = Some(mutations);
        self
    }

    pub fn checkpoint_on_close(mut self, enabled: bool) -> Self {
        self.checkpoint_on_close = enabled;
        self
    }

    /// Capped at [`MAX_RECORD_LEN`].
    pub fn max_record_len(mut self, bytes: usize) -> Self {
        self.max_record_len = bytes.min(MAX_RECORD_LEN);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub topic: String,
    pub state: TableState,
    pub records: usize,
    pub last_sequence: Sequence,
    pub checkpoint_sequence: Option<Sequence>,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub journal_failures: u64,
}

struct TableView {
    index: KeyIndex,
    state: TableState,
    last_sequence: Sequence,
    checkpoint_sequence: Option<Sequence>,
}

struct WriterState {
    journal: Journal,
    since_checkpoint: u64,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    journal_failures: AtomicU64,
}

pub struct Table {
    definition: TopicDefinition,
    codec: Arc<dyn RecordCodec>,
    storage: Arc<dyn JournalStorage>,
    options: TableOptions,
    writer: Mutex<WriterState>,
    view: RwLock<TableView>,
    counters: Counters,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("topic", &self.definition.topic)
            .field("storage", &self.storage.describe())
            .field("state", &self.state())
            .finish()
    }
}

/// Lazy iteration over the table as it was when the scan started.
pub struct Scan {
    inner: <KeyIndex as IntoIterator>::IntoIter,
    remaining: usize,
}

impl Iterator for Scan {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let (_, indexed) = self.inner.next()?;
        self.remaining -= 1;
        Some(indexed.record.clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Scan {}

impl Table {
    /// Opens the table and recovers it from checkpoint and journal. The
    /// returned table is `Ready`; on failure it never becomes visible.
    pub async fn open(
        definition: TopicDefinition,
        storage: Arc<dyn JournalStorage>,
        options: TableOptions,
    ) -> Result<Arc<Self>> {
        let journal = Journal::open(Arc::clone(&storage), options.durability)?;
        let table = Arc::new(Self {
            codec: codec_for(definition.message_type),
            definition,
            storage,
            options,
            writer: Mutex::new(WriterState {
                journal,
                since_checkpoint: 0,
            }),
            view: RwLock::new(TableView {
                index: KeyIndex::new(),
                state: TableState::Unloaded,
                last_sequence: 0,
                checkpoint_sequence: None,
            }),
            counters: Counters::default(),
        });
        table.load().await?;
        Ok(table)
    }

    async fn load(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.set_state(TableState::Recovering)?;

        let recovered = RecoveryManager::new(&self.definition.topic, self.storage.as_ref())
            .recover(&writer.journal)
            .and_then(|state| {
                writer
                    .journal
                    .start_appending(state.last_sequence, state.tail)
                    .map(|_| state)
            });
        let recovered = match recovered {
            Ok(state) => state,
            Err(err) => {
                error!(topic = %self.definition.topic, error = %err, "table recovery failed");
                self.set_state(TableState::Closed)?;
                return Err(err);
            }
        };

        let mut view = self.view.write()?;
        view.index = recovered.index;
        view.last_sequence = recovered.last_sequence;
        view.checkpoint_sequence = recovered.checkpoint_sequence;
        view.state = TableState::Ready;
        info!(
            topic = %self.definition.topic,
            records = view.index.len(),
            last_sequence = view.last_sequence,
            "table ready"
        );
        Ok(())
    }

    pub fn definition(&self) -> &TopicDefinition {
        &self.definition
    }

    pub fn topic(&self) -> &str {
        &self.definition.topic
    }

    pub fn codec(&self) -> &Arc<dyn RecordCodec> {
        &self.codec
    }

    pub fn state(&self) -> TableState {
        self.view
            .read()
            .map(|view| view.state)
            .unwrap_or(TableState::Closed)
    }

    pub fn last_sequence(&self) -> Sequence {
        self.view.read().map(|view| view.last_sequence).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Validates `data`, journals it as an insert or update of its key and
    /// applies it. Returns the assigned sequence.
    pub async fn put(&self, data: &[u8]) -> Result<Sequence> {
        if data.len() > self.options.max_record_len {
            return Err(SowError::MalformedRecord(format!(
                "record of {} bytes exceeds the {} byte limit",
                data.len(),
                self.options.max_record_len
            )));
        }
        let record = self.codec.to_record(data, &self.definition.keys)?;

        let mut writer = self.writer.lock().await;
        self.ensure_writable()?;

        let operation = if self.view.read()?.index.contains(&record.key) {
            Operation::Update
        } else {
            Operation::Insert
        };
        let sequence = self.commit(&mut writer, Mutation::upsert(operation, record))?;

        match operation {
            Operation::Insert => self.counters.inserts.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.updates.fetch_add(1, Ordering::Relaxed),
        };
        self.after_commit(&mut writer);
        Ok(sequence)
    }

    /// Deletes `key`. Deleting an absent key is a no-op that journals nothing
    /// and returns `None`.
    pub async fn delete(&self, key: &Key) -> Result<Option<Sequence>> {
        let mut writer = self.writer.lock().await;
        self.ensure_writable()?;

        if !self.view.read()?.index.contains(key) {
            debug!(topic = %self.definition.topic, %key, "delete of absent key ignored");
            return Ok(None);
        }
        let sequence = self.commit(&mut writer, Mutation::delete(key.clone()))?;

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.after_commit(&mut writer);
        Ok(Some(sequence))
    }

    fn commit(&self, writer: &mut WriterState, mutation: Mutation) -> Result<Sequence> {
        let entry = match writer.journal.append(mutation) {
            Ok(entry) => entry,
            Err(err) => {
                if !writer.journal.is_healthy() {
                    self.degrade(&err);
                }
                return Err(err);
            }
        };
        let sequence = entry.sequence;
        let operation = entry.operation;
        let key = entry.key.clone();

        let mut view = self.view.write()?;
        view.index.apply(entry)?;
        view.last_sequence = sequence;
        debug!(topic = %self.definition.topic, sequence, %operation, %key, "committed");
        Ok(sequence)
    }

    fn after_commit(&self, writer: &mut WriterState) {
        writer.since_checkpoint += 1;
        if let Some(every) = self.options.checkpoint_every
            && writer.since_checkpoint >= every
            && let Err(err) = self.write_checkpoint(writer)
        {
            warn!(topic = %self.definition.topic, error = %err, "automatic checkpoint failed");
        }
    }

    fn degrade(&self, err: &SowError) {
        self.counters.journal_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut view) = self.view.write() {
            view.state = TableState::Degraded;
        }
        error!(topic = %self.definition.topic, error = %err, "journal write failed, table degraded");
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn get(&self, key: &Key) -> Result<Option<Record>> {
        let view = self.view.read()?;
        self.ensure_readable(view.state)?;
        Ok(view.index.lookup(key).map(|indexed| indexed.record.clone()))
    }

    /// Iterates over a snapshot taken now. Later writes do not show up in it.
    pub fn scan(&self) -> Result<Scan> {
        let snapshot = self.snapshot()?;
        Ok(Scan {
            remaining: snapshot.len(),
            inner: snapshot.into_iter(),
        })
    }

    /// O(1) copy of the current index, including record sequences.
    pub fn snapshot(&self) -> Result<KeyIndex> {
        let view = self.view.read()?;
        self.ensure_readable(view.state)?;
        Ok(view.index.clone())
    }

    pub fn len(&self) -> usize {
        self.view.read().map(|view| view.index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Result<TableStats> {
        let view = self.view.read()?;
        Ok(TableStats {
            topic: self.definition.topic.clone(),
            state: view.state,
            records: view.index.len(),
            last_sequence: view.last_sequence,
            checkpoint_sequence: view.checkpoint_sequence,
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            journal_failures: self.counters.journal_failures.load(Ordering::Relaxed),
        })
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Writes a checkpoint of the current contents and starts a new journal
    /// segment. Returns the checkpoint's sequence.
    pub async fn checkpoint(&self) -> Result<Sequence> {
        let mut writer = self.writer.lock().await;
        self.ensure_writable()?;
        self.write_checkpoint(&mut writer)
    }

    /// Checkpoints, then removes journal segments the checkpoint covers.
    /// Returns the number of segments removed.
    pub async fn compact(&self) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        self.ensure_writable()?;
        let sequence = self.write_checkpoint(&mut writer)?;
        writer.journal.purge_through(sequence)
    }

    fn write_checkpoint(&self, writer: &mut WriterState) -> Result<Sequence> {
        let (index, sequence) = {
            let view = self.view.read()?;
            (view.index.clone(), view.last_sequence)
        };
        Checkpoint::capture(&self.definition.topic, sequence, &index).save(self.storage.as_ref())?;
        writer.since_checkpoint = 0;
        self.view.write()?.checkpoint_sequence = Some(sequence);
        info!(topic = %self.definition.topic, sequence, records = index.len(), "checkpoint written");

        // The checkpoint stands even if the old segment cannot be sealed;
        // appends then continue in it.
        writer.journal.rotate().map_err(|err| {
            warn!(topic = %self.definition.topic, sequence, error = %err, "journal rotation after checkpoint failed");
            SowError::JournalWriteFailure(format!(
                "checkpoint at {} written, starting a new segment failed: {}",
                sequence, err
            ))
        })?;
        Ok(sequence)
    }

    /// Operator intervention after a journal failure: repairs the journal and
    /// accepts writes again. A no-op on a ready table.
    pub async fn resume(&self) -> Result<TableState> {
        let mut writer = self.writer.lock().await;
        match self.state() {
            TableState::Degraded => {}
            TableState::Closed => return Err(SowError::TableClosed(self.definition.topic.clone())),
            state => return Ok(state),
        }
        writer.journal.repair()?;
        self.set_state(TableState::Ready)?;
        info!(topic = %self.definition.topic, "table resumed");
        Ok(TableState::Ready)
    }

    /// Flushes the journal and closes the table for good. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let state = self.state();
        if state == TableState::Closed {
            return Ok(());
        }
        // Cut a failed append so that it is not replayed on the next open.
        if state == TableState::Degraded
            && let Err(err) = writer.journal.repair()
        {
            warn!(topic = %self.definition.topic, error = %err, "journal repair on close failed");
        }
        if self.options.checkpoint_on_close
            && state == TableState::Ready
            && let Err(err) = self.write_checkpoint(&mut writer)
        {
            warn!(topic = %self.definition.topic, error = %err, "checkpoint on close failed");
        }
        if let Err(err) = writer.journal.sync() {
            warn!(topic = %self.definition.topic, error = %err, "journal sync on close failed");
        }
        self.set_state(TableState::Closed)?;
        info!(topic = %self.definition.topic, "table closed");
        Ok(())
    }

    fn set_state(&self, state: TableState) -> Result<()> {
        self.view.write()?.state = state;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state() {
            TableState::Ready => Ok(()),
            TableState::Closed => Err(SowError::TableClosed(self.definition.topic.clone())),
            state => Err(SowError::TableNotWritable {
                topic: self.definition.topic.clone(),
                state: state.to_string(),
            }),
        }
    }

    fn ensure_readable(&self, state: TableState) -> Result<()> {
        match state {
            s if s.accepts_reads() => Ok(()),
            TableState::Closed => Err(SowError::TableClosed(self.definition.topic.clone())),
            state => Err(SowError::TableNotWritable {
                topic: self.definition.topic.clone(),
                state: state.to_string(),
            }),
        }
    }
}
