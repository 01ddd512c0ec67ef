//! Binary frames exchanged between relay clients and the relay server.
//!
//! Frames are bincode-encoded and carried in WebSocket binary messages.
//! Requests carry a `request_id` answered by exactly one `Ack`, `Value` or
//! `Error` frame; `Message` frames are pushed for subscribed channels.
//!
//! ```text
//! client                               server
//!   │ Subscribe{id, channel} ─────────► │
//!   │ ◄──────────────────── Ack{id, 0}  │
//!   │ Publish{id, channel, payload} ──► │ ──► Message{channel, payload} to subscribers
//!   │ ◄──────────── Ack{id, receivers}  │
//!   │ Get{id, key} ───────────────────► │
//!   │ ◄──────────────── Value{id, ..}   │
//! ```

use serde::{Deserialize, Serialize};

use crate::bus::BusError;

/// Relay wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Publish {
        request_id: u64,
        channel: String,
        payload: Vec<u8>,
    },
    Subscribe {
        request_id: u64,
        channel: String,
    },
    Unsubscribe {
        request_id: u64,
        channel: String,
    },
    /// Pushed to subscribers of `channel`
    Message { channel: String, payload: Vec<u8> },
    Get { request_id: u64, key: String },
    Value {
        request_id: u64,
        value: Option<Vec<u8>>,
    },
    SetEx {
        request_id: u64,
        key: String,
        value: Vec<u8>,
        ttl_secs: u64,
    },
    Ack { request_id: u64, receivers: u64 },
    Error { request_id: u64, message: String },
    Ping,
    Pong,
}

impl RelayFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        Ok(frame)
    }

    /// Request id of a reply frame.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Self::Value { request_id, .. }
            | Self::Ack { request_id, .. }
            | Self::Error { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("frame decoding failed: {0}")]
    Decode(String),
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<RelayError> for BusError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Encode(e) | RelayError::Decode(e) => BusError::Protocol(e),
            other => BusError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_frame_roundtrip() {
        let frame = RelayFrame::Publish {
            request_id: 7,
            channel: "wiki:yjs:updates".into(),
            payload: vec![1, 2, 3],
        };
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_reply_to() {
        assert_eq!(RelayFrame::Ack { request_id: 3, receivers: 1 }.reply_to(), Some(3));
        assert_eq!(RelayFrame::Value { request_id: 4, value: None }.reply_to(), Some(4));
        assert_eq!(RelayFrame::Ping.reply_to(), None);
        assert_eq!(
            RelayFrame::Message { channel: "c".into(), payload: vec![] }.reply_to(),
            None
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            RelayFrame::decode(&[0xff, 0xff, 0xff]),
            Err(RelayError::Decode(_))
        ));
    }

    #[test]
    fn test_error_maps_to_bus_error() {
        let err: BusError = RelayError::Decode("bad".into()).into();
        assert!(matches!(err, BusError::Protocol(_)));
        let err: BusError = RelayError::ConnectionClosed.into();
        assert!(matches!(err, BusError::Unavailable(_)));
    }
}
