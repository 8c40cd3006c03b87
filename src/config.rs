//! Declarative server configuration.
//!
//! Loaded from JSON or built in code. Only the topic definitions and the
//! transaction log settings drive behaviour here; transports, the admin
//! listener and logging targets are recognized and validated so that one
//! configuration file can serve the whole process.

use crate::codec::KeyPath;
use crate::core::{MessageType, Result, SowError};
use crate::storage::{DurabilityMode, FileStorage, TableOptions};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const JOURNAL_SUFFIX: &str = "journal";

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Process identity.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    #[serde(default)]
    pub transports: Vec<TransportConfig>,

    /// One bookmark store table per entry.
    #[serde(default)]
    pub topics: Vec<TopicDefinition>,

    #[serde(default)]
    pub logging: Vec<LoggingTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_log: Option<TransactionLogConfig>,
}

impl ServerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            admin: None,
            transports: Vec::new(),
            topics: Vec::new(),
            logging: Vec::new(),
            transaction_log: None,
        }
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses without validating, for callers that need the
    /// logging targets before validation warnings are emitted.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            SowError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_json(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config = Self::parse_json(text)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SowError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    pub fn admin(mut self, interface: &str) -> Self {
        self.admin = Some(AdminConfig {
            interface: interface.to_string(),
        });
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn topic(mut self, topic: TopicDefinition) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn logging(mut self, target: LoggingTarget) -> Self {
        self.logging.push(target);
        self
    }

    pub fn transaction_log(mut self, transaction_log: TransactionLogConfig) -> Self {
        self.transaction_log = Some(transaction_log);
        self
    }

    pub fn find_topic(&self, name: &str) -> Option<&TopicDefinition> {
        self.topics.iter().find(|t| t.topic == name)
    }

    /// Rejects configurations no table could be opened from. Suspicious but
    /// workable settings only produce warnings.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SowError::ConfigError("name must not be empty".to_string()));
        }

        let mut transports = HashSet::new();
        for transport in &self.transports {
            if !transports.insert(transport.name.as_str()) {
                return Err(SowError::ConfigError(format!(
                    "duplicate transport '{}'",
                    transport.name
                )));
            }
            if transport.address().is_none() {
                return Err(SowError::ConfigError(format!(
                    "transport '{}' needs an inet_addr or a port",
                    transport.name
                )));
            }
        }

        if let Some(log) = &self.transaction_log {
            for journaled in &log.topics {
                journaled.regex()?;
            }
            if log.checkpoint_every == Some(0) {
                return Err(SowError::ConfigError(
                    "checkpoint_every must be at least 1".to_string(),
                ));
            }
        }

        let mut topics = HashSet::new();
        let mut files = HashSet::new();
        let mut journal_dirs = HashSet::new();
        for topic in &self.topics {
            if topic.topic.trim().is_empty() {
                return Err(SowError::ConfigError("topic name must not be empty".to_string()));
            }
            if !topics.insert(topic.topic.as_str()) {
                return Err(SowError::ConfigError(format!("duplicate topic '{}'", topic.topic)));
            }
            if !files.insert(topic.file_name.as_path()) {
                return Err(SowError::ConfigError(format!(
                    "topic '{}' shares file {} with another topic",
                    topic.topic,
                    topic.file_name.display()
                )));
            }
            let journal_dir = self.journal_dir_for(topic)?;
            if !journal_dirs.insert(journal_dir.clone()) {
                return Err(SowError::ConfigError(format!(
                    "topic '{}' shares journal directory {} with another topic",
                    topic.topic,
                    journal_dir.display()
                )));
            }
            if topic.keys.is_empty() {
                return Err(SowError::ConfigError(format!(
                    "topic '{}' declares no keys",
                    topic.topic
                )));
            }

            match self.journaled_topic(&topic.topic)? {
                Some(journaled) if journaled.message_type != topic.message_type => {
                    return Err(SowError::ConfigError(format!(
                        "topic '{}' is {} but transaction log pattern '{}' declares {}",
                        topic.topic, topic.message_type, journaled.pattern, journaled.message_type
                    )));
                }
                Some(_) => {}
                None => warn!(
                    "topic '{}' matches no transaction log pattern, journaling next to {}",
                    topic.topic,
                    topic.file_name.display()
                ),
            }
        }

        if self.logging.is_empty() {
            warn!("no logging targets configured, defaulting to stderr");
        }
        Ok(())
    }

    /// The transaction log entry whose pattern matches `topic`, if any.
    pub fn journaled_topic(&self, topic: &str) -> Result<Option<&JournaledTopic>> {
        let Some(log) = &self.transaction_log else {
            return Ok(None);
        };
        for journaled in &log.topics {
            if journaled.regex()?.is_match(topic) {
                return Ok(Some(journaled));
            }
        }
        Ok(None)
    }

    /// Journal segments for a topic live under the transaction log directory
    /// when a pattern matches it, otherwise beside its checkpoint file.
    pub fn journal_dir_for(&self, topic: &TopicDefinition) -> Result<PathBuf> {
        if let Some(log) = &self.transaction_log
            && self.journaled_topic(&topic.topic)?.is_some()
        {
            return Ok(log.journal_directory.join(sanitize_topic(&topic.topic)));
        }
        let mut dir = topic.file_name.clone().into_os_string();
        dir.push(".");
        dir.push(JOURNAL_SUFFIX);
        Ok(PathBuf::from(dir))
    }

    pub fn table_options_for(&self, _topic: &TopicDefinition) -> TableOptions {
        match &self.transaction_log {
            Some(log) => TableOptions {
                durability: log.durability,
                checkpoint_every: log.checkpoint_every,
                checkpoint_on_close: log.checkpoint_on_close,
                ..TableOptions::default()
            },
            None => TableOptions::default(),
        }
    }

    pub fn storage_for(&self, topic: &TopicDefinition) -> Result<FileStorage> {
        FileStorage::new(self.journal_dir_for(topic)?, &topic.file_name)
    }
}

/// Turns a topic name into a single path component: `/amps/bookmarkStore`
/// becomes `amps_bookmarkStore`.
pub fn sanitize_topic(topic: &str) -> String {
    let cleaned: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "topic".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Admin and transports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inet_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: String,
}

impl TransportConfig {
    pub fn tcp(name: &str, inet_addr: &str, protocol: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: TransportKind::Tcp,
            inet_addr: Some(inet_addr.to_string()),
            port: None,
            protocol: protocol.to_string(),
        }
    }

    /// `inet_addr` wins over a bare `port`, which listens on all interfaces.
    pub fn address(&self) -> Option<String> {
        match (&self.inet_addr, self.port) {
            (Some(addr), _) => Some(addr.clone()),
            (None, Some(port)) => Some(format!("0.0.0.0:{}", port)),
            (None, None) => None,
        }
    }
}

// ============================================================================
// Topics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDefinition {
    pub topic: String,
    /// Checkpoint file of the table.
    pub file_name: PathBuf,
    pub message_type: MessageType,
    pub keys: Vec<KeyPath>,
}

impl TopicDefinition {
    pub fn new<P: Into<PathBuf>>(
        topic: &str,
        file_name: P,
        message_type: MessageType,
        keys: &[&str],
    ) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| KeyPath::parse(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            topic: topic.to_string(),
            file_name: file_name.into(),
            message_type,
            keys,
        })
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = SowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "stats" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" | "emergency" | "fatal" => Ok(LogLevel::Critical),
            other => Err(SowError::ConfigError(format!("unknown log level '{}'", other))),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter_directive())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogProtocol {
    Stdout,
    #[default]
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingTarget {
    pub protocol: LogProtocol,
    pub level: LogLevel,
    /// Diagnostic code ranges such as `00-0015`, kept for the host runtime.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_errors: Vec<String>,
}

impl LoggingTarget {
    pub fn new(protocol: LogProtocol, level: LogLevel) -> Self {
        Self {
            protocol,
            level,
            include_errors: Vec::new(),
        }
    }
}

// ============================================================================
// Transaction log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLogConfig {
    pub journal_directory: PathBuf,
    #[serde(default)]
    pub topics: Vec<JournaledTopic>,
    #[serde(default)]
    pub durability: DurabilityMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_every: Option<u64>,
    #[serde(default)]
    pub checkpoint_on_close: bool,
}

impl TransactionLogConfig {
    pub fn new<P: Into<PathBuf>>(journal_directory: P) -> Self {
        Self {
            journal_directory: journal_directory.into(),
            topics: Vec::new(),
            durability: DurabilityMode::default(),
            checkpoint_every: None,
            checkpoint_on_close: false,
        }
    }

    pub fn topic(mut self, pattern: &str, message_type: MessageType) -> Self {
        self.topics.push(JournaledTopic {
            pattern: pattern.to_string(),
            message_type,
        });
        self
    }

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
}

/// Topics whose names fully match `pattern` are journaled under the
/// transaction log directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournaledTopic {
    pub pattern: String,
    pub message_type: MessageType,
}

impl JournaledTopic {
    pub fn regex(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.pattern)).map_err(|e| {
            SowError::ConfigError(format!("invalid topic pattern '{}': {}", self.pattern, e))
        })
    }
}
