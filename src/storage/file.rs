use super::engine::{JournalStorage, SegmentWriter};
use crate::core::{Result, Sequence, SowError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SEGMENT_EXTENSION: &str = "journal";

/// Journal segments as files in one directory, checkpoint as a single file.
///
/// Segment files are named after their base sequence, zero padded so that
/// lexical and numeric order agree: `00000000000000000001.journal`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    journal_dir: PathBuf,
    checkpoint_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(journal_dir: P, checkpoint_path: Q) -> Result<Self> {
        let journal_dir = journal_dir.as_ref().to_path_buf();
        fs::create_dir_all(&journal_dir).map_err(|e| {
            SowError::IoError(format!(
                "Failed to create journal directory {}: {}",
                journal_dir.display(),
                e
            ))
        })?;

        let checkpoint_path = checkpoint_path.as_ref().to_path_buf();
        if let Some(parent) = checkpoint_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                SowError::IoError(format!(
                    "Failed to create checkpoint directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            journal_dir,
            checkpoint_path,
        })
    }

    pub fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn segment_path(&self, base: Sequence) -> PathBuf {
        self.journal_dir
            .join(format!("{:020}.{}", base, SEGMENT_EXTENSION))
    }

    fn sync_dir(&self) -> io::Result<()> {
        #[cfg(unix)]
        File::open(&self.journal_dir)?.sync_all()?;
        Ok(())
    }
}

impl JournalStorage for FileStorage {
    fn list_segments(&self) -> Result<Vec<Sequence>> {
        let mut bases: Vec<Sequence> = fs::read_dir(&self.journal_dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()?.to_str()? != SEGMENT_EXTENSION {
                    return None;
                }
                path.file_stem()?.to_str()?.parse::<Sequence>().ok()
            })
            .collect();
        bases.sort_unstable();
        Ok(bases)
    }

    fn open_segment(&self, base: Sequence) -> Result<Box<dyn Read + Send>> {
        let path = self.segment_path(base);
        let file = File::open(&path).map_err(|e| {
            SowError::IoError(format!("Failed to open segment {}: {}", path.display(), e))
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn segment_writer(&self, base: Sequence) -> Result<Box<dyn SegmentWriter>> {
        let path = self.segment_path(base);
        let created = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                SowError::IoError(format!("Failed to open segment {}: {}", path.display(), e))
            })?;
        if created {
            self.sync_dir()?;
        }
        Ok(Box::new(FileSegmentWriter { file, path }))
    }

    fn remove_segment(&self, base: Sequence) -> Result<()> {
        let path = self.segment_path(base);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                SowError::IoError(format!("Failed to remove segment {}: {}", path.display(), e))
            })?;
            self.sync_dir()?;
        }
        Ok(())
    }

    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        if !self.checkpoint_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.checkpoint_path).map_err(|e| {
            SowError::IoError(format!(
                "Failed to read checkpoint {}: {}",
                self.checkpoint_path.display(),
                e
            ))
        })?;
        Ok(Some(bytes))
    }

    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()> {
        let dir = match self.checkpoint_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| SowError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(bytes)
            .map_err(|e| SowError::IoError(format!("Failed to write checkpoint: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| SowError::IoError(format!("Failed to sync checkpoint: {}", e)))?;
        temp.persist(&self.checkpoint_path)
            .map_err(|e| SowError::IoError(format!("Failed to rename checkpoint: {}", e)))?;
        #[cfg(unix)]
        File::open(&dir)?.sync_all()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.journal_dir.display().to_string()
    }
}

#[derive(Debug)]
struct FileSegmentWriter {
    file: File,
    path: PathBuf,
}

impl SegmentWriter for FileSegmentWriter {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        fs::metadata(&self.path).map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_segments_listed_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            FileStorage::new(temp_dir.path().join("journal"), temp_dir.path().join("t.sow")).unwrap();

        for base in [12u64, 1, 100] {
            let mut writer = storage.segment_writer(base).unwrap();
            writer.append(b"x").unwrap();
            writer.sync().unwrap();
        }
        fs::write(temp_dir.path().join("journal").join("notes.txt"), b"ignored").unwrap();

        assert_eq!(storage.list_segments().unwrap(), vec![1, 12, 100]);
        storage.remove_segment(12).unwrap();
        assert_eq!(storage.list_segments().unwrap(), vec![1, 100]);
    }

    #[test]
    fn test_truncate_then_append() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), temp_dir.path().join("t.sow")).unwrap();
        let mut writer = storage.segment_writer(1).unwrap();
        writer.append(b"hello world").unwrap();
        writer.truncate(5).unwrap();
        writer.append(b"!").unwrap();
        writer.flush().unwrap();

        let mut buf = Vec::new();
        storage.open_segment(1).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello!");
        assert_eq!(writer.len().unwrap(), 6);
    }

    #[test]
    fn test_checkpoint_replaced_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let storage =
            FileStorage::new(temp_dir.path().join("j"), temp_dir.path().join("sow/t.sow")).unwrap();
        assert!(storage.read_checkpoint().unwrap().is_none());

        storage.write_checkpoint(b"first").unwrap();
        storage.write_checkpoint(b"second").unwrap();
        assert_eq!(storage.read_checkpoint().unwrap().unwrap(), b"second");
        assert!(storage.checkpoint_path().exists());
    }
}
