//! Presence propagation between processes.
//!
//! Loop prevention:
//! ```text
//!   inbound message ─► ProcessingGuard(doc) ─► apply (origin RemoteSync) ─► guard dropped
//!                                                      │
//!   on_awareness_update ◄──── host dispatch ◄──────────┘  (async, guard already gone)
//!     skipped when origin == RemoteSync
//! ```
//! The `RemoteSync` origin is what keeps applied presence from being
//! published again. The guard only covers hooks that run while the apply is
//! still in progress, i.e. hosts that dispatch synchronously.
//! Remote clients are remembered per document so that when the host times
//! one out locally the removal is not echoed back to its owner.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{Inbound, SyncEnvelope, SyncSettings};
use crate::bus::PubSub;
use crate::config::CollabConfig;
use crate::hooks::{AwarenessUpdatePayload, Extension, HookError};
use crate::replica::{ClientId, Origin, ReplicaRegistry};

/// Counters for the awareness channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessSyncStats {
    pub published: u64,
    pub applied: u64,
    pub dropped: u64,
    /// Remote clients timed out locally and not propagated
    pub suppressed_removals: u64,
}

#[derive(Default)]
struct AtomicStats {
    published: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    suppressed_removals: AtomicU64,
}

struct Inner {
    settings: SyncSettings,
    pubsub: Arc<dyn PubSub>,
    registry: RwLock<Option<Arc<dyn ReplicaRegistry>>>,
    /// document → client ids introduced through the channel
    remote_clients: RwLock<HashMap<String, HashSet<ClientId>>>,
    /// documents currently applying a remote message
    processing: std::sync::Mutex<HashSet<String>>,
    stats: AtomicStats,
}

/// Marks a document as mid-application of a remote message until dropped.
struct ProcessingGuard<'a> {
    inner: &'a Inner,
    document_name: String,
}

impl<'a> ProcessingGuard<'a> {
    fn enter(inner: &'a Inner, document_name: &str) -> Self {
        if let Ok(mut processing) = inner.processing.lock() {
            processing.insert(document_name.to_string());
        }
        Self {
            inner,
            document_name: document_name.to_string(),
        }
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut processing) = self.inner.processing.lock() {
            processing.remove(&self.document_name);
        }
    }
}

/// Publishes local presence changes and applies presence from other
/// processes.
pub struct AwarenessSyncExtension {
    inner: Arc<Inner>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl AwarenessSyncExtension {
    pub fn new(settings: SyncSettings, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                pubsub,
                registry: RwLock::new(None),
                remote_clients: RwLock::new(HashMap::new()),
                processing: std::sync::Mutex::new(HashSet::new()),
                stats: AtomicStats::default(),
            }),
            subscriber: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CollabConfig, pubsub: Arc<dyn PubSub>) -> Self {
        let settings = SyncSettings {
            process_id: config.process_id.clone(),
            channel: config.awareness_channel.clone(),
            debug: config.debug,
        };
        Self::new(settings, pubsub)
    }

    pub fn stats(&self) -> AwarenessSyncStats {
        let stats = &self.inner.stats;
        AwarenessSyncStats {
            published: stats.published.load(Ordering::Relaxed),
            applied: stats.applied.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            suppressed_removals: stats.suppressed_removals.load(Ordering::Relaxed),
        }
    }

    /// Client ids of a document that arrived through the channel.
    pub async fn remote_clients(&self, document_name: &str) -> HashSet<ClientId> {
        self.inner
            .remote_clients
            .read()
            .await
            .get(document_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Process one raw channel message.
    pub async fn handle_message(&self, bytes: &[u8]) -> Inbound {
        self.inner.handle_message(bytes).await
    }
}

impl Inner {
    fn is_processing(&self, document_name: &str) -> bool {
        self.processing
            .lock()
            .map(|processing| processing.contains(document_name))
            .unwrap_or(false)
    }

    async fn handle_message(&self, bytes: &[u8]) -> Inbound {
        let outcome = self.route(bytes).await;
        if outcome == Inbound::Applied {
            self.stats.applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn route(&self, bytes: &[u8]) -> Inbound {
        let (envelope, payload) = match SyncEnvelope::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping malformed awareness update: {e}");
                return Inbound::Malformed;
            }
        };
        if envelope.process_id == self.settings.process_id {
            return Inbound::OwnMessage;
        }

        let registry = self.registry.read().await.clone();
        let replica = match registry {
            Some(registry) => registry.resident(&envelope.document_name).await,
            None => None,
        };
        let Some(replica) = replica else {
            return Inbound::NotResident;
        };

        let document_name = envelope.document_name;
        let _guard = ProcessingGuard::enter(self, &document_name);
        let change = match replica.apply_awareness_delta(&payload, Origin::RemoteSync) {
            Ok(change) => change,
            Err(e) => {
                log::error!("Rejected awareness update for {document_name}: {e}");
                return Inbound::Rejected;
            }
        };

        let mut remote = self.remote_clients.write().await;
        let known = remote.entry(document_name.clone()).or_default();
        known.extend(change.added.iter().copied());
        for id in &change.removed {
            known.remove(id);
        }
        log::log!(
            self.settings.message_level(),
            "Applied awareness for {document_name} from {} (+{} ~{} -{})",
            envelope.process_id,
            change.added.len(),
            change.updated.len(),
            change.removed.len()
        );
        Inbound::Applied
    }
}

#[async_trait]
impl Extension for AwarenessSyncExtension {
    fn name(&self) -> &'static str {
        "awareness-sync"
    }

    async fn on_configure(&self, registry: Arc<dyn ReplicaRegistry>) -> Result<(), HookError> {
        *self.inner.registry.write().await = Some(registry);

        let mut subscription = self.inner.pubsub.subscribe(&self.inner.settings.channel).await?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                inner.handle_message(&message).await;
            }
            log::debug!("Awareness subscription on {} closed", inner.settings.channel);
        });

        if let Some(previous) = self.subscriber.lock().await.replace(handle) {
            previous.abort();
        }
        log::info!("Awareness sync subscribed to {}", self.inner.settings.channel);
        Ok(())
    }

    async fn on_awareness_update(&self, payload: &AwarenessUpdatePayload) -> Result<(), HookError> {
        let document_name = &payload.document_name;
        if payload.origin == Origin::RemoteSync || self.inner.is_processing(document_name) {
            return Ok(());
        }

        let mut locally_removed = Vec::new();
        {
            let mut remote = self.inner.remote_clients.write().await;
            let known = remote.get_mut(document_name);
            match known {
                Some(known) => {
                    for id in &payload.removed {
                        if known.remove(id) {
                            self.inner
                                .stats
                                .suppressed_removals
                                .fetch_add(1, Ordering::Relaxed);
                        } else {
                            locally_removed.push(*id);
                        }
                    }
                }
                None => locally_removed.extend(payload.removed.iter().copied()),
            }
        }

        let changed: Vec<ClientId> = payload
            .added
            .iter()
            .chain(payload.updated.iter())
            .chain(locally_removed.iter())
            .copied()
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let clients: Vec<ClientId> = if payload.added.is_empty() {
            changed
        } else {
            // New clients need the full picture of who is already here.
            let mut all: Vec<ClientId> = payload.replica.awareness_clients().into_iter().collect();
            all.extend(locally_removed.iter().copied());
            all
        };

        let update = payload.replica.encode_awareness_delta(&clients)?;
        let envelope = SyncEnvelope::new(&self.inner.settings.process_id, document_name, &update);
        let bytes = envelope.encode()?;
        let receivers = self
            .inner
            .pubsub
            .publish(&self.inner.settings.channel, &bytes)
            .await?;
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        log::log!(
            self.inner.settings.message_level(),
            "Published awareness of {} clients for {document_name} to {receivers} receivers",
            clients.len()
        );
        Ok(())
    }

    async fn after_unload_document(&self, document_name: &str) -> Result<(), HookError> {
        self.inner.remote_clients.write().await.remove(document_name);
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), HookError> {
        if let Some(handle) = self.subscriber.lock().await.take() {
            handle.abort();
            log::info!("Awareness sync stopped");
        }
        Ok(())
    }
}
