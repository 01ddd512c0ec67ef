//! Document update propagation between processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{Inbound, SyncEnvelope, SyncSettings};
use crate::bus::{PubSub, SharedCache};
use crate::config::CollabConfig;
use crate::hooks::{ChangePayload, Extension, HookError, LoadDocumentPayload, StoreDocumentPayload};
use crate::replica::{Origin, Replica, ReplicaRegistry};

/// Counters for the document channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSyncStats {
    pub published: u64,
    pub applied: u64,
    pub dropped: u64,
    pub cache_failures: u64,
}

#[derive(Default)]
struct AtomicStats {
    published: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    cache_failures: AtomicU64,
}

struct Inner {
    settings: SyncSettings,
    doc_key_prefix: String,
    ttl: Duration,
    cache: Arc<dyn SharedCache>,
    pubsub: Arc<dyn PubSub>,
    registry: RwLock<Option<Arc<dyn ReplicaRegistry>>>,
    stats: AtomicStats,
}

/// Publishes local deltas, mirrors snapshots to the cache and applies
/// deltas published by other processes.
pub struct DocumentSyncExtension {
    inner: Arc<Inner>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentSyncExtension {
    pub fn new(
        settings: SyncSettings,
        doc_key_prefix: impl Into<String>,
        ttl: Duration,
        cache: Arc<dyn SharedCache>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                doc_key_prefix: doc_key_prefix.into(),
                ttl,
                cache,
                pubsub,
                registry: RwLock::new(None),
                stats: AtomicStats::default(),
            }),
            subscriber: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &CollabConfig,
        cache: Arc<dyn SharedCache>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let settings = SyncSettings {
            process_id: config.process_id.clone(),
            channel: config.update_channel.clone(),
            debug: config.debug,
        };
        Self::new(settings, config.doc_key_prefix.clone(), config.doc_ttl, cache, pubsub)
    }

    pub fn process_id(&self) -> &str {
        &self.inner.settings.process_id
    }

    pub fn stats(&self) -> DocumentSyncStats {
        let stats = &self.inner.stats;
        DocumentSyncStats {
            published: stats.published.load(Ordering::Relaxed),
            applied: stats.applied.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            cache_failures: stats.cache_failures.load(Ordering::Relaxed),
        }
    }

    /// Process one raw channel message.
    pub async fn handle_message(&self, bytes: &[u8]) -> Inbound {
        self.inner.handle_message(bytes).await
    }
}

impl Inner {
    fn doc_key(&self, document_name: &str) -> String {
        format!("{}{}", self.doc_key_prefix, document_name)
    }

    async fn refresh_cache(&self, document_name: &str, replica: &Replica) {
        let snapshot = replica.encode_full_state();
        if let Err(e) = self
            .cache
            .set_ex(&self.doc_key(document_name), &snapshot, self.ttl)
            .await
        {
            self.stats.cache_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("Snapshot cache write failed for {document_name}: {e}");
        }
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
        let (envelope, delta) = match SyncEnvelope::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping malformed document update: {e}");
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
            log::log!(
                self.settings.message_level(),
                "Ignoring update for {} (not resident)",
                envelope.document_name
            );
            return Inbound::NotResident;
        };

        match replica.apply_delta(&delta, Origin::RemoteSync, None) {
            Ok(()) => {
                log::log!(
                    self.settings.message_level(),
                    "Applied {} byte update to {} from {}",
                    delta.len(),
                    envelope.document_name,
                    envelope.process_id
                );
                Inbound::Applied
            }
            Err(e) => {
                log::error!(
                    "Rejected update for {} from {}: {e}",
                    envelope.document_name,
                    envelope.process_id
                );
                Inbound::Rejected
            }
        }
    }
}

#[async_trait]
impl Extension for DocumentSyncExtension {
    fn name(&self) -> &'static str {
        "document-sync"
    }

    async fn on_configure(&self, registry: Arc<dyn ReplicaRegistry>) -> Result<(), HookError> {
        *self.inner.registry.write().await = Some(registry);

        let mut subscription = self.inner.pubsub.subscribe(&self.inner.settings.channel).await?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                inner.handle_message(&message).await;
            }
            log::debug!("Document update subscription on {} closed", inner.settings.channel);
        });

        if let Some(previous) = self.subscriber.lock().await.replace(handle) {
            previous.abort();
        }
        log::info!(
            "Document sync subscribed to {} as {}",
            self.inner.settings.channel,
            self.inner.settings.process_id
        );
        Ok(())
    }

    async fn on_load_document(&self, payload: &LoadDocumentPayload) -> Result<(), HookError> {
        let key = self.inner.doc_key(&payload.document_name);
        match self.inner.cache.get(&key).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = payload.replica.apply_delta(&snapshot, Origin::RemoteSync, None) {
                    log::warn!("Cached snapshot for {} unusable: {e}", payload.document_name);
                } else {
                    log::debug!("Merged cached snapshot into {}", payload.document_name);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.inner.stats.cache_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Snapshot cache read failed for {}: {e}", payload.document_name);
            }
        }
        Ok(())
    }

    async fn on_change(&self, payload: &ChangePayload) -> Result<(), HookError> {
        if !payload.origin.is_local() {
            return Ok(());
        }

        self.inner
            .refresh_cache(&payload.document_name, &payload.replica)
            .await;

        let envelope = SyncEnvelope::new(
            &self.inner.settings.process_id,
            &payload.document_name,
            &payload.update,
        );
        let published = match envelope.encode() {
            Ok(bytes) => {
                self.inner
                    .pubsub
                    .publish(&self.inner.settings.channel, &bytes)
                    .await
            }
            Err(e) => Err(e),
        };
        match published {
            Ok(receivers) => {
                self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
                log::log!(
                    self.inner.settings.message_level(),
                    "Published {} byte update for {} to {receivers} receivers",
                    payload.update.len(),
                    payload.document_name
                );
            }
            Err(e) => log::warn!("Update publish failed for {}: {e}", payload.document_name),
        }
        Ok(())
    }

    async fn on_store_document(&self, payload: &StoreDocumentPayload) -> Result<(), HookError> {
        self.inner
            .refresh_cache(&payload.document_name, &payload.replica)
            .await;
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), HookError> {
        if let Some(handle) = self.subscriber.lock().await.take() {
            handle.abort();
            log::info!("Document sync stopped");
        }
        Ok(())
    }
}
