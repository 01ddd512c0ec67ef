//! Shared transport between processes: a TTL key cache plus pub/sub channels.
//!
//! Two implementations:
//! - [`MemoryBus`]: in-process channels and cache (single node, tests)
//! - [`crate::relay::RelayClient`]: WebSocket client of a `collab-relay`
//!
//! Both are best-effort accelerants. A failing bus degrades propagation to
//! local-only; it never fails an edit or a checkpoint.
//!
//! Delivery follows pub/sub semantics: every subscriber of a channel receives
//! every message published after it subscribed, the publisher's own
//! subscriptions included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

/// Messages buffered per subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How often expired cache entries are dropped.
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("bus protocol error: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
}

/// Keyed byte cache with per-key expiry.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError>;
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BusError>;
}

/// Named broadcast channels.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish to a channel; returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// Receiving end of a channel subscription.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Arc<Vec<u8>>>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is gone.
    ///
    /// Lagged subscribers skip what they missed; sync messages are
    /// idempotent CRDT deltas so a later message or snapshot recovers.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber on {} lagged, skipped {skipped} messages", self.channel);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_published: u64,
    pub cache_writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub active_channels: usize,
}

/// Atomic counters, lock-free on the hot path.
#[derive(Default)]
struct AtomicBusStats {
    messages_published: AtomicU64,
    cache_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Channel name → broadcast sender.
///
/// Shared by [`MemoryBus`] and the relay server.
pub struct ChannelMap {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
}

impl ChannelMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the sender for a channel.
    pub async fn sender(&self, channel: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(sender) = channels.get(channel) {
            return sender.clone();
        }
        let (sender, _) = broadcast::channel(self.capacity);
        channels.insert(channel.to_string(), sender.clone());
        sender
    }

    /// Fan out pre-encoded bytes; returns the receiver count.
    pub async fn send(&self, channel: &str, payload: Arc<Vec<u8>>) -> usize {
        let sender = {
            let channels = self.channels.read().await;
            channels.get(channel).cloned()
        };
        match sender {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender(channel).await.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

/// TTL cache shared by [`MemoryBus`] and the relay server.
#[derive(Default)]
pub struct TtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// In-process bus. Processes sharing one `Arc<MemoryBus>` see each other.
pub struct MemoryBus {
    channels: ChannelMap,
    cache: TtlCache,
    /// Expired entries are purged on the first write after this is
    /// `CACHE_PURGE_INTERVAL` old.
    last_purge: std::sync::Mutex<Instant>,
    available: AtomicBool,
    stats: AtomicBusStats,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: ChannelMap::new(capacity),
            cache: TtlCache::new(),
            last_purge: std::sync::Mutex::new(Instant::now()),
            available: AtomicBool::new(true),
            stats: AtomicBusStats::default(),
        }
    }

    /// Simulate an outage of the shared infrastructure.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus offline".into()))
        }
    }

    async fn purge_if_due(&self) {
        let due = match self.last_purge.lock() {
            Ok(mut last) if last.elapsed() >= CACHE_PURGE_INTERVAL => {
                *last = Instant::now();
                true
            }
            _ => false,
        };
        if due {
            let purged = self.cache.purge_expired().await;
            if purged > 0 {
                log::debug!("Purged {purged} expired cache entries");
            }
        }
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            cache_writes: self.stats.cache_writes.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            active_channels: self.channels.len().await,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        self.check_available()?;
        let value = self.cache.get(key).await;
        let counter = if value.is_some() {
            &self.stats.cache_hits
        } else {
            &self.stats.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), BusError> {
        self.check_available()?;
        self.cache.set_ex(key, value.to_vec(), ttl).await;
        self.stats.cache_writes.fetch_add(1, Ordering::Relaxed);
        self.purge_if_due().await;
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BusError> {
        self.check_available()?;
        let receivers = self.channels.send(channel, Arc::new(payload.to_vec())).await;
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        self.check_available()?;
        let rx = self.channels.subscribe(channel).await;
        Ok(Subscription::new(channel, rx))
    }
}
