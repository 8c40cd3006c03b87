use crate::core::{Result, SowError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Document;
use std::fmt;
use std::str::FromStr;

/// Absolute path to a field inside a message, written `/clientName` or
/// `/order/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    raw: String,
    segments: Vec<String>,
}

impl KeyPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(SowError::ConfigError(format!(
                "key path '{}' must start with '/'",
                raw
            )));
        };
        if rest.is_empty() {
            return Err(SowError::ConfigError(format!("key path '{}' is empty", raw)));
        }

        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(SowError::ConfigError(format!(
                "key path '{}' contains an empty segment",
                raw
            )));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Top level field name when the path has a single segment.
    pub fn field_name(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn resolve<'a>(&self, document: &'a Document) -> Option<&'a Document> {
        self.segments
            .iter()
            .try_fold(document, |node, segment| match node {
                Document::Object(map) => map.get(segment),
                Document::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for KeyPath {
    type Err = SowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for KeyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for KeyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
