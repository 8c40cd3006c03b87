// ============================================================================
// sowstore Library
// ============================================================================

pub mod bookmark;
pub mod codec;
pub mod config;
pub mod core;
pub mod facade;
pub mod storage;

// Re-export main types for convenience
pub use bookmark::{BookmarkStore, EPOCH};
pub use codec::{KeyPath, RecordCodec, codec_for};
pub use config::{ServerConfig, TopicDefinition, TransactionLogConfig};
pub use core::{Key, KeyValue, MessageType, Operation, Record, Result, Sequence, SowError, TableState};
pub use facade::TableRegistry;
pub use storage::{
    DurabilityMode, FileStorage, JournalStorage, MemoryStorage, Table, TableOptions, TableStats,
};
