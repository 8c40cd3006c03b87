//! Record codecs: validate message payloads and pull keys out of them.
//!
//! Payloads stay opaque byte blobs inside the store. A codec is only asked to
//! prove that the bytes parse as the topic's message type and to extract the
//! configured key fields.

pub mod json;
pub mod key_path;
pub mod msgpack;

pub use json::JsonCodec;
pub use key_path::KeyPath;
pub use msgpack::MessagePackCodec;

use crate::core::{Key, KeyValue, MessageType, Record, Result, SowError};
pub use serde_json::Value as Document;
use std::fmt::Debug;
use std::sync::Arc;

/// Pluggable codec selected by a topic's message type.
pub trait RecordCodec: Send + Sync + Debug {
    fn message_type(&self) -> MessageType;

    /// Parses raw payload bytes. Fails with `MalformedRecord`.
    fn decode(&self, bytes: &[u8]) -> Result<Document>;

    fn encode(&self, document: &Document) -> Result<Vec<u8>>;

    /// Resolves every key path in order and coerces each value to a key scalar.
    fn extract_key(&self, document: &Document, paths: &[KeyPath]) -> Result<Key> {
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            let node = path
                .resolve(document)
                .ok_or_else(|| SowError::MissingKeyField(path.to_string()))?;
            values.push(scalar_from_document(path, node)?);
        }
        Ok(Key::new(values))
    }

    /// Decodes `bytes`, extracts the key and wraps both into a record.
    fn to_record(&self, bytes: &[u8], paths: &[KeyPath]) -> Result<Record> {
        let document = self.decode(bytes)?;
        let key = self.extract_key(&document, paths)?;
        Ok(Record::new(key, self.message_type(), bytes.to_vec()))
    }
}

pub fn codec_for(message_type: MessageType) -> Arc<dyn RecordCodec> {
    match message_type {
        MessageType::Json => Arc::new(JsonCodec),
        MessageType::Msgpack => Arc::new(MessagePackCodec),
    }
}

fn scalar_from_document(path: &KeyPath, node: &Document) -> Result<KeyValue> {
    let mismatch = |found: &str| SowError::KeyTypeMismatch {
        path: path.to_string(),
        found: found.to_string(),
    };

    match node {
        Document::String(s) => Ok(KeyValue::Text(s.clone())),
        Document::Bool(b) => Ok(KeyValue::Boolean(*b)),
        Document::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(KeyValue::Integer(i));
            }
            if n.is_u64() {
                return Err(mismatch("integer out of range"));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(KeyValue::Integer(f as i64))
                }
                _ => Err(mismatch("fractional number")),
            }
        }
        Document::Null => Err(mismatch("null")),
        Document::Array(_) => Err(mismatch("array")),
        Document::Object(_) => Err(mismatch("object")),
    }
}
