use crate::core::{Result, Sequence};
use std::fmt::Debug;
use std::io::{self, Read};

/// Durable byte storage for one table's journal segments and checkpoint.
///
/// Segments are identified by their base sequence (the sequence of the first
/// entry they hold). Implementations must make `SegmentWriter::sync` and
/// `write_checkpoint` durable across process crashes.
pub trait JournalStorage: Send + Sync + Debug {
    /// Base sequences of all existing segments, ascending.
    fn list_segments(&self) -> Result<Vec<Sequence>>;

    fn open_segment(&self, base: Sequence) -> Result<Box<dyn Read + Send>>;

    /// Opens a segment for appending, creating it when absent.
    fn segment_writer(&self, base: Sequence) -> Result<Box<dyn SegmentWriter>>;

    fn remove_segment(&self, base: Sequence) -> Result<()>;

    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>>;

    /// Replaces the checkpoint atomically: readers see the old or the new
    /// image, never a mix.
    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()>;

    /// Human readable location, used in logs.
    fn describe(&self) -> String;
}

/// Append handle on a single segment.
pub trait SegmentWriter: Send + Debug {
    fn append(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    /// Cuts the segment back to `len` bytes, dropping a torn tail.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn len(&self) -> io::Result<u64>;
}
