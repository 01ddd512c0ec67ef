//! Cross-process propagation of document updates and presence.
//!
//! ```text
//!  process A                         bus                         process B
//!  ─────────                         ───                         ─────────
//!  local edit ─► DocumentSync ─► SETEX wiki:doc:<name>
//!                             └► PUBLISH wiki:yjs:updates ───► DocumentSync ─► apply (RemoteSync)
//!  presence  ─► AwarenessSync ─► PUBLISH wiki:yjs:awareness ─► AwarenessSync ─► apply (RemoteSync)
//! ```
//!
//! Every message is wrapped in a [`SyncEnvelope`]; receivers drop envelopes
//! carrying their own process id.

pub mod awareness;
pub mod document;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::bus::BusError;

pub use awareness::AwarenessSyncExtension;
pub use document::DocumentSyncExtension;

/// Wire form of a channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub process_id: String,
    pub document_name: String,
    /// Base64 of the opaque update bytes
    pub payload: String,
}

impl SyncEnvelope {
    pub fn new(process_id: &str, document_name: &str, payload: &[u8]) -> Self {
        Self {
            process_id: process_id.to_string(),
            document_name: document_name.to_string(),
            payload: BASE64.encode(payload),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::Protocol(e.to_string()))
    }

    /// Parse an envelope and its payload; anything malformed is an error.
    pub fn decode(bytes: &[u8]) -> Result<(Self, Vec<u8>), BusError> {
        let envelope: SyncEnvelope =
            serde_json::from_slice(bytes).map_err(|e| BusError::Protocol(e.to_string()))?;
        let payload = BASE64
            .decode(envelope.payload.as_bytes())
            .map_err(|e| BusError::Protocol(format!("payload is not base64: {e}")))?;
        Ok((envelope, payload))
    }
}

/// Channel and logging settings shared by both sync extensions.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub process_id: String,
    pub channel: String,
    pub debug: bool,
}

impl SyncSettings {
    /// Per-message diagnostics go to info when debugging, else trace.
    pub(crate) fn message_level(&self) -> log::Level {
        if self.debug {
            log::Level::Info
        } else {
            log::Level::Trace
        }
    }
}

/// What happened to one inbound channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Applied,
    Malformed,
    OwnMessage,
    NotResident,
    Rejected,
}
