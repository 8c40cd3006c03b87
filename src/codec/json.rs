use super::RecordCodec;
use crate::core::{MessageType, Result, SowError};
use serde_json::Value as Document;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn message_type(&self) -> MessageType {
        MessageType::Json
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        let document: Document = serde_json::from_slice(bytes)
            .map_err(|e| SowError::MalformedRecord(format!("invalid json: {}", e)))?;
        if !document.is_object() {
            return Err(SowError::MalformedRecord(
                "json message must be an object".to_string(),
            ));
        }
        Ok(document)
    }

    fn encode(&self, document: &Document) -> Result<Vec<u8>> {
        serde_json::to_vec(document)
            .map_err(|e| SowError::MalformedRecord(format!("cannot encode json: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, SowError::MalformedRecord(_)));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(JsonCodec.decode(b"[1,2,3]").is_err());
        assert!(JsonCodec.decode(b"\"text\"").is_err());
    }

    #[test]
    fn test_encode_then_decode() {
        let doc = json!({"clientName": "alice", "subId": "1"});
        let bytes = JsonCodec.encode(&doc).unwrap();
        assert_eq!(JsonCodec.decode(&bytes).unwrap(), doc);
    }
}
