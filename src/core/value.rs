use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar that can take part in a key.
///
/// The set is closed so that keys have a total order. Ordering between
/// variants follows declaration order, then the natural order of the payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Boolean(bool),
    Integer(i64),
    Text(String),
}

impl KeyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "BOOLEAN",
            Self::Integer(_) => "INTEGER",
            Self::Text(_) => "TEXT",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Parses a command-line style literal: `true`/`false`, an integer, or text.
    pub fn parse_literal(raw: &str) -> Self {
        match raw {
            "true" => Self::Boolean(true),
            "false" => Self::Boolean(false),
            _ => raw
                .parse::<i64>()
                .map(Self::Integer)
                .unwrap_or_else(|_| Self::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for KeyValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}
