pub mod checkpoint;
pub mod engine;
pub mod file;
pub mod frame;
pub mod index;
pub mod journal;
pub mod memory;
pub mod recovery;
pub mod table;

pub use checkpoint::Checkpoint;
pub use engine::{JournalStorage, SegmentWriter};
pub use file::FileStorage;
pub use index::{IndexedRecord, KeyIndex};
pub use journal::{DurabilityMode, Journal, JournalEntry, JournalReader, Mutation};
pub use memory::MemoryStorage;
pub use recovery::{RecoveredState, RecoveryManager};
pub use table::{Scan, Table, TableOptions, TableStats};
