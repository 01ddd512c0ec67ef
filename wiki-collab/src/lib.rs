//! # wiki-collab: Server-side collaboration core for wiki pages
//!
//! Plugs into a replica host (the process owning editor WebSocket sessions
//! and one CRDT replica per open page) through lifecycle hooks.
//!
//! ## Architecture
//!
//! ```text
//!  editor sessions ──► replica host ──► ExtensionChain
//!                                          │
//!        ┌──────────────────┬──────────────┼──────────────────┬──────────────────┐
//!        ▼                  ▼                                 ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐                 ┌──────────────┐   ┌──────────────┐
//! │Authentication│  │ Persistence  │                 │ DocumentSync │   │AwarenessSync │
//! │ token + tier │  │ load/ckpt    │                 │ deltas+cache │   │  presence    │
//! └──────┬───────┘  └──────┬───────┘                 └──────┬───────┘   └──────┬───────┘
//!        │                 │                                │                  │
//!        ▼                 ▼                                ▼                  ▼
//!   AccessDirectory     PageStore ──► PageEvents      SharedCache + PubSub (MemoryBus
//!   (Postgres)          (Postgres)    JobQueue        or RelayClient ◄─► collab-relay)
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: collab tokens and permission tiers
//! - [`persistence`]: relational load and checkpoint of replicas
//! - [`sync`]: cross-process document and presence propagation
//! - [`replica`]: CRDT replica with typed change origins
//! - [`hooks`]: the host callback contract
//! - [`bus`] / [`relay`]: shared cache and pub/sub transports
//! - [`storage`]: Postgres and in-memory stores

pub mod auth;
pub mod bus;
pub mod config;
pub mod content;
pub mod document;
pub mod events;
pub mod hooks;
pub mod persistence;
pub mod relay;
pub mod replica;
pub mod storage;
pub mod sync;

use std::sync::Arc;

// Re-exports for convenience
pub use auth::{AuthContext, AuthError, AuthenticationExtension, Authorizer, TokenService};
pub use bus::{BusError, MemoryBus, PubSub, SharedCache};
pub use config::{CollabConfig, ConfigError};
pub use document::DocumentName;
pub use events::{BacklinkIndexer, BacklinkJob, JobQueue, PageEvent, PageEvents, RetryPolicy};
pub use hooks::{Extension, ExtensionChain, HookError};
pub use persistence::PersistenceExtension;
pub use relay::{RelayClient, RelayClientConfig, RelayServer};
pub use replica::{Origin, Replica, ReplicaEvent, ReplicaRegistry, ResidentReplicas};
pub use storage::{AccessDirectory, MemoryStore, PageStore, PgStore, StoreError};
pub use sync::{AwarenessSyncExtension, DocumentSyncExtension};

/// Shared infrastructure the extensions run against.
#[derive(Clone)]
pub struct CollabServices {
    pub pages: Arc<dyn PageStore>,
    pub directory: Arc<dyn AccessDirectory>,
    pub cache: Arc<dyn SharedCache>,
    pub pubsub: Arc<dyn PubSub>,
    pub events: PageEvents,
    pub jobs: Option<Arc<JobQueue>>,
}

impl CollabServices {
    /// Store and transport chosen by configuration: Postgres when
    /// `DATABASE_URL` is set, a relay client when `COLLAB_RELAY_URL` is set,
    /// in-memory otherwise.
    pub async fn from_config(config: &CollabConfig) -> Result<Self, StoreError> {
        let (pages, directory, indexer): (
            Arc<dyn PageStore>,
            Arc<dyn AccessDirectory>,
            Arc<dyn BacklinkIndexer>,
        ) = match &config.database_url {
            Some(url) => {
                let store = Arc::new(PgStore::connect(url).await?);
                (store.clone(), store.clone(), store)
            }
            None => {
                log::warn!("DATABASE_URL not set, using in-memory page store");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store.clone(), store)
            }
        };

        let (cache, pubsub): (Arc<dyn SharedCache>, Arc<dyn PubSub>) = match &config.relay_url {
            Some(url) => {
                let client = Arc::new(RelayClient::connect(RelayClientConfig::new(url.clone())));
                (client.clone(), client)
            }
            None => {
                let bus = Arc::new(MemoryBus::new());
                (bus.clone(), bus)
            }
        };

        Ok(Self {
            pages,
            directory,
            cache,
            pubsub,
            events: PageEvents::new(),
            jobs: Some(Arc::new(JobQueue::start(indexer, RetryPolicy::default()))),
        })
    }
}

/// Extensions in dispatch order: authentication, persistence, then both sync
/// extensions unless sync is disabled.
pub fn build_extensions(
    config: &CollabConfig,
    services: CollabServices,
) -> Result<ExtensionChain, ConfigError> {
    let tokens = TokenService::new(config.require_secret()?);
    let authorizer = Arc::new(Authorizer::new(
        tokens,
        services.pages.clone(),
        services.directory.clone(),
    ));

    if services.jobs.is_none() {
        log::warn!("No backlink job queue configured, backlink indexing disabled");
    }

    let mut chain = ExtensionChain::new()
        .with(Arc::new(AuthenticationExtension::new(authorizer)))
        .with(Arc::new(PersistenceExtension::new(
            services.pages.clone(),
            services.events.clone(),
            services.jobs.clone(),
        )));

    if config.sync_disabled {
        log::info!("Cross-process sync disabled");
    } else {
        chain.push(Arc::new(DocumentSyncExtension::from_config(
            config,
            services.cache.clone(),
            services.pubsub.clone(),
        )));
        chain.push(Arc::new(AwarenessSyncExtension::from_config(
            config,
            services.pubsub.clone(),
        )));
    }

    log::info!("Collab extensions: {}", chain.names().join(", "));
    Ok(chain)
}
