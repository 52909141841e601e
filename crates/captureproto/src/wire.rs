//! Payload serialization for producer frames.
//!
//! MessagePack in production, JSON when a human needs to read the bytes.

use serde::{de::DeserializeOwned, Serialize};

/// Errors while encoding, decoding or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire format for serializing message payloads
pub trait WireFormat {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError>;
    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError>;
}

/// MessagePack format - fast and compact for production
///
/// Structs are written as maps (field names included) so enum payloads stay
/// self-describing across versions.
pub struct MsgPackFormat;

impl WireFormat for MsgPackFormat {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// JSON format - readable for debugging
pub struct JsonFormat;

impl WireFormat for JsonFormat {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaptureOptions, ProducerCaptureEvent, ProducerCommand, ProducerMessage};

    #[test]
    fn test_msgpack_command() {
        let command = ProducerCommand::StartCapture {
            options: CaptureOptions::new(42, 1234.0).with_extra("mode", "full"),
        };

        let bytes = MsgPackFormat::encode(&command).unwrap();
        let decoded: ProducerCommand = MsgPackFormat::decode(&bytes).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_msgpack_keeps_event_bytes() {
        let message = ProducerMessage::BufferedEvents {
            events: vec![
                ProducerCaptureEvent::new(vec![0u8, 159, 146, 150]).with_timestamp(17),
                ProducerCaptureEvent::new(Vec::<u8>::new()),
            ],
        };

        let bytes = MsgPackFormat::encode(&message).unwrap();
        let decoded: ProducerMessage = MsgPackFormat::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_json_unit_variant() {
        let bytes = JsonFormat::encode(&ProducerMessage::AllEventsSent).unwrap();
        assert_eq!(bytes, b"\"all_events_sent\"");
        let decoded: ProducerMessage = JsonFormat::decode(&bytes).unwrap();
        assert_eq!(decoded, ProducerMessage::AllEventsSent);
    }

    #[test]
    fn test_msgpack_is_compact() {
        let message = ProducerMessage::BufferedEvents {
            events: vec![ProducerCaptureEvent::new(vec![7u8; 64])],
        };

        let msgpack_bytes = MsgPackFormat::encode(&message).unwrap();
        let json_bytes = JsonFormat::encode(&message).unwrap();
        assert!(msgpack_bytes.len() < json_bytes.len());
    }

    #[test]
    fn test_garbage_is_an_error() {
        let result: Result<ProducerMessage, _> = MsgPackFormat::decode(&[0xc1, 0x00]);
        assert!(matches!(result, Err(WireError::MsgPackDecode(_))));
    }
}
