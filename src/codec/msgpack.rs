use super::RecordCodec;
use crate::core::{MessageType, Result, SowError};
use serde_json::Value as Document;

/// MessagePack messages. Maps must use string keys to be addressable by a
/// key path.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl RecordCodec for MessagePackCodec {
    fn message_type(&self) -> MessageType {
        MessageType::Msgpack
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        let document: Document = rmp_serde::from_slice(bytes)
            .map_err(|e| SowError::MalformedRecord(format!("invalid msgpack: {}", e)))?;
        if !document.is_object() {
            return Err(SowError::MalformedRecord(
                "msgpack message must be a map".to_string(),
            ));
        }
        Ok(document)
    }

    fn encode(&self, document: &Document) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(document)
            .map_err(|e| SowError::MalformedRecord(format!("cannot encode msgpack: {}", e)))
    }
}
