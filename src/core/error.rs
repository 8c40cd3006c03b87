use thiserror::Error;

#[derive(Error, Debug)]
pub enum SowError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Missing key field '{0}'")]
    MissingKeyField(String),

    #[error("Key type mismatch at '{path}': {found} is not a comparable scalar")]
    KeyTypeMismatch { path: String, found: String },

    #[error("Journal write failure: {0}")]
    JournalWriteFailure(String),

    #[error("Recovery corruption: {0}")]
    RecoveryCorruption(String),

    #[error("Table '{topic}' does not accept writes while {state}")]
    TableNotWritable { topic: String, state: String },

    #[error("Table '{0}' is closed")]
    TableClosed(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl SowError {
    /// Errors caused by the caller's input. The table is unchanged and the
    /// caller may retry with corrected input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord(_) | Self::MissingKeyField(_) | Self::KeyTypeMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SowError>;

impl<T> From<std::sync::PoisonError<T>> for SowError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for SowError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
