pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, SowError};
pub use types::{Key, MessageType, Operation, Record, Sequence, TableState};
pub use value::KeyValue;
