use super::engine::{JournalStorage, SegmentWriter};
use crate::core::{Result, Sequence, SowError};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryInner {
    segments: BTreeMap<Sequence, Vec<u8>>,
    checkpoint: Option<Vec<u8>>,
    fail_writes: bool,
    /// Appends land but flush, sync and truncate fail.
    fail_after_append: bool,
    /// When set, the next append keeps only this many bytes and then fails.
    tear_next_append: Option<usize>,
}

/// In-process storage. Clones share the same bytes, so dropping a table and
/// reopening it over a clone behaves like a process restart.
///
/// Writes can be made to fail to exercise journal failure handling.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write, sync and truncate fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Keeps accepting appended bytes but fails every flush, sync and
    /// truncate, like a device that loses the ability to persist.
    pub fn set_fail_after_append(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_after_append = fail;
        }
    }

    /// Simulates a crash in the middle of the next append: only `keep` bytes
    /// of it reach storage and the append reports an error.
    pub fn tear_next_append(&self, keep: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tear_next_append = Some(keep);
        }
    }

    pub fn segment_bytes(&self, base: Sequence) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.segments.get(&base).cloned()
    }

    /// Overwrites raw segment bytes, for corruption tests.
    pub fn put_segment_bytes(&self, base: Sequence, bytes: Vec<u8>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.segments.insert(base, bytes);
        }
    }

    pub fn has_checkpoint(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.checkpoint.is_some())
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        Ok(self.inner.lock()?)
    }
}

impl JournalStorage for MemoryStorage {
    fn list_segments(&self) -> Result<Vec<Sequence>> {
        Ok(self.lock()?.segments.keys().copied().collect())
    }

    fn open_segment(&self, base: Sequence) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .lock()?
            .segments
            .get(&base)
            .cloned()
            .ok_or_else(|| SowError::IoError(format!("segment {} does not exist", base)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn segment_writer(&self, base: Sequence) -> Result<Box<dyn SegmentWriter>> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(SowError::IoError("storage is not writable".to_string()));
        }
        inner.segments.entry(base).or_default();
        Ok(Box::new(MemorySegmentWriter {
            inner: Arc::clone(&self.inner),
            base,
        }))
    }

    fn remove_segment(&self, base: Sequence) -> Result<()> {
        self.lock()?.segments.remove(&base);
        Ok(())
    }

    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.checkpoint.clone())
    }

    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(SowError::IoError("storage is not writable".to_string()));
        }
        inner.checkpoint = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug)]
struct MemorySegmentWriter {
    inner: Arc<Mutex<MemoryInner>>,
    base: Sequence,
}

impl MemorySegmentWriter {
    fn with_segment<T>(
        &self,
        op: impl FnOnce(&mut MemoryInner) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        if inner.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is not writable",
            ));
        }
        op(&mut inner)
    }

    fn after_append(&self, op: impl FnOnce(&mut MemoryInner) -> io::Result<()>) -> io::Result<()> {
        self.with_segment(|inner| {
            if inner.fail_after_append {
                return Err(io::Error::other("device error"));
            }
            op(inner)
        })
    }
}

impl SegmentWriter for MemorySegmentWriter {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        let base = self.base;
        self.with_segment(|inner| {
            let torn = inner.tear_next_append.take();
            let segment = inner.segments.entry(base).or_default();
            match torn {
                Some(keep) => {
                    segment.extend_from_slice(&buf[..keep.min(buf.len())]);
                    Err(io::Error::new(io::ErrorKind::WriteZero, "torn write"))
                }
                None => {
                    segment.extend_from_slice(buf);
                    Ok(())
                }
            }
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.after_append(|_| Ok(()))
    }

    fn sync(&mut self) -> io::Result<()> {
        self.after_append(|_| Ok(()))
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let base = self.base;
        self.after_append(|inner| {
            if let Some(segment) = inner.segments.get_mut(&base) {
                segment.truncate(len as usize);
            }
            Ok(())
        })
    }

    fn len(&self) -> io::Result<u64> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(inner.segments.get(&self.base).map_or(0, |s| s.len() as u64))
    }
}
