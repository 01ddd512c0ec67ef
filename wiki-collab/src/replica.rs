//! Resident CRDT replicas and the opaque merge interface.
//!
//! Architecture:
//! ```text
//!   local edit ──► Replica::transact_local ─┐
//!   channel msg ─► Replica::apply_delta ────┼──► ReplicaEvent ──► host ──► ExtensionChain
//!   presence ───► Replica::apply_awareness ─┘        (broadcast)
//!
//!   ResidentReplicas: document name → Arc<Replica>   (one per process/document)
//! ```
//!
//! The yrs document is only touched through four operations: `apply_delta`,
//! `encode_full_state`, `encode_awareness_delta` and `apply_awareness_delta`.
//! Everything above this module treats update bytes as opaque.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::Awareness;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update, XmlFragment, XmlFragmentRef};

use crate::content;

/// Awareness client id as assigned by the CRDT library.
pub type ClientId = yrs::block::ClientID;

/// Root XML fragment holding the rich-text tree.
pub const CONTENT_FRAGMENT: &str = "default";

/// Buffered replica events per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Where a mutation came from.
///
/// Every hook that could re-broadcast or re-attribute a change branches on
/// this instead of comparing transaction tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Authored through a session attached to this process.
    Local,
    /// Replayed from another process via the sync channel or snapshot cache.
    RemoteSync,
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// Client ids touched by one awareness application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Notifications a host turns into lifecycle hook calls.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    Changed {
        update: Arc<Vec<u8>>,
        origin: Origin,
        user: Option<Uuid>,
    },
    Awareness {
        change: AwarenessChange,
        origin: Origin,
    },
}

/// Errors from the merge interface.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("awareness error: {0}")]
    Awareness(String),
    #[error("content conversion failed: {0}")]
    Content(String),
}

/// One process's in-memory instance of a collaborative document.
pub struct Replica {
    doc: Doc,
    fragment: XmlFragmentRef,
    awareness: Mutex<Awareness>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl Replica {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    fn from_doc(doc: Doc) -> Self {
        let fragment = doc.get_or_insert_xml_fragment(CONTENT_FRAGMENT);
        let awareness = Awareness::new(doc.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            doc,
            fragment,
            awareness: Mutex::new(awareness),
            events,
        }
    }

    /// Subscribe to change and presence notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    /// True when the content fragment holds no nodes.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.fragment.len(&txn) == 0
    }

    // ─── Document state ───────────────────────────────────────────────

    /// Merge an update delta (or full snapshot) into this replica.
    pub fn apply_delta(
        &self,
        delta: &[u8],
        origin: Origin,
        user: Option<Uuid>,
    ) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(delta).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        let _ = self.events.send(ReplicaEvent::Changed {
            update: Arc::new(delta.to_vec()),
            origin,
            user,
        });
        Ok(())
    }

    /// Full-state snapshot sufficient to rebuild the replica from scratch.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Run a local edit against the content fragment and return its delta.
    pub fn transact_local<F>(&self, user: Option<Uuid>, edit: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut, &XmlFragmentRef),
    {
        let delta = {
            let mut txn = self.doc.transact_mut();
            edit(&mut txn, &self.fragment);
            txn.encode_update_v1()
        };
        let _ = self.events.send(ReplicaEvent::Changed {
            update: Arc::new(delta.clone()),
            origin: Origin::Local,
            user,
        });
        delta
    }

    /// Structured (ProseMirror-shaped) projection of the content tree.
    pub fn content_json(&self) -> serde_json::Value {
        let txn = self.doc.transact();
        content::fragment_to_json(&txn, &self.fragment)
    }

    /// Build the content tree from a structured projection.
    ///
    /// Used for entities that have never been opened collaboratively.
    pub fn import_content(&self, json: &serde_json::Value) -> Result<(), ReplicaError> {
        let mut txn = self.doc.transact_mut();
        content::json_into_fragment(&mut txn, &self.fragment, json)
            .map_err(ReplicaError::Content)
    }

    // ─── Awareness ────────────────────────────────────────────────────

    /// Client ids currently present in the awareness state.
    ///
    /// Removed clients stay in the awareness map as entries without data
    /// (their clock is still needed to order later updates); they are not
    /// present.
    pub fn awareness_clients(&self) -> HashSet<ClientId> {
        match self.awareness.lock() {
            Ok(awareness) => awareness
                .iter()
                .filter(|(_, state)| state.data.is_some())
                .map(|(id, _)| id)
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    /// Encode the awareness entries of `clients` with the standard encoder.
    pub fn encode_awareness_delta(&self, clients: &[ClientId]) -> Result<Vec<u8>, ReplicaError> {
        let awareness = self
            .awareness
            .lock()
            .map_err(|e| ReplicaError::Awareness(e.to_string()))?;
        let update = awareness
            .update_with_clients(clients.iter().copied())
            .map_err(|e| ReplicaError::Awareness(e.to_string()))?;
        Ok(update.encode_v1())
    }

    /// Apply a standard awareness update and report which clients changed.
    pub fn apply_awareness_delta(
        &self,
        payload: &[u8],
        origin: Origin,
    ) -> Result<AwarenessChange, ReplicaError> {
        let update = AwarenessUpdate::decode_v1(payload)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let touched: Vec<ClientId> = update.clients.keys().copied().collect();

        let before = self.awareness_clients();
        {
            let awareness = self
                .awareness
                .lock()
                .map_err(|e| ReplicaError::Awareness(e.to_string()))?;
            awareness
                .apply_update(update)
                .map_err(|e| ReplicaError::Awareness(e.to_string()))?;
        }
        let after = self.awareness_clients();

        let change = AwarenessChange {
            added: after.difference(&before).copied().collect(),
            updated: touched
                .into_iter()
                .filter(|id| before.contains(id) && after.contains(id))
                .collect(),
            removed: before.difference(&after).copied().collect(),
        };
        self.emit_awareness(&change, origin);
        Ok(change)
    }

    /// Drop a client's presence (disconnect or timeout on this process).
    pub fn remove_awareness_client(&self, client: ClientId) -> AwarenessChange {
        let present = self.awareness_clients().contains(&client);
        if let Ok(awareness) = self.awareness.lock() {
            awareness.remove_state(client);
        }
        let change = AwarenessChange {
            removed: if present { vec![client] } else { Vec::new() },
            ..AwarenessChange::default()
        };
        self.emit_awareness(&change, Origin::Local);
        change
    }

    fn emit_awareness(&self, change: &AwarenessChange, origin: Origin) {
        if change.is_empty() {
            return;
        }
        let _ = self.events.send(ReplicaEvent::Awareness {
            change: change.clone(),
            origin,
        });
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Resident replica registry ────────────────────────────────────────

/// Lookup of replicas currently resident on this process.
///
/// Provided by the host on configure; sync components use it to route
/// inbound channel messages.
#[async_trait]
pub trait ReplicaRegistry: Send + Sync {
    async fn resident(&self, document_name: &str) -> Option<Arc<Replica>>;
}

/// Document name → replica map for hosts that keep replicas in-process.
#[derive(Default)]
pub struct ResidentReplicas {
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
}

impl ResidentReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the replica for a document.
    ///
    /// The flag is true when the replica was created by this call.
    pub async fn get_or_create(&self, document_name: &str) -> (Arc<Replica>, bool) {
        // Fast path: read lock
        {
            let replicas = self.replicas.read().await;
            if let Some(replica) = replicas.get(document_name) {
                return (replica.clone(), false);
            }
        }

        let mut replicas = self.replicas.write().await;
        if let Some(replica) = replicas.get(document_name) {
            return (replica.clone(), false);
        }
        let replica = Arc::new(Replica::new());
        replicas.insert(document_name.to_string(), replica.clone());
        (replica, true)
    }

    /// Replace the replica for a document (used when a loader swaps it).
    pub async fn insert(&self, document_name: &str, replica: Arc<Replica>) {
        self.replicas
            .write()
            .await
            .insert(document_name.to_string(), replica);
    }

    pub async fn remove(&self, document_name: &str) -> Option<Arc<Replica>> {
        self.replicas.write().await.remove(document_name)
    }

    pub async fn len(&self) -> usize {
        self.replicas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.replicas.read().await.is_empty()
    }

    pub async fn document_names(&self) -> Vec<String> {
        self.replicas.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ReplicaRegistry for ResidentReplicas {
    async fn resident(&self, document_name: &str) -> Option<Arc<Replica>> {
        self.replicas.read().await.get(document_name).cloned()
    }
}
