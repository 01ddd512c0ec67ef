//! Shared fixtures: a minimal replica host and a seeded workspace.
//!
//! `TestHost` plays the part of one collab process: it owns resident
//! replicas, forwards their events through an `ExtensionChain`, and exposes
//! the lifecycle triggers (open, edit, checkpoint, unload) a real host would
//! fire from its WebSocket sessions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use wiki_collab::auth::AuthContext;
use wiki_collab::bus::{MemoryBus, PubSub, SharedCache};
use wiki_collab::config::CollabConfig;
use wiki_collab::events::{JobQueue, PageEvents};
use wiki_collab::replica::ClientId;
use wiki_collab::hooks::{
    AuthenticatePayload, ExtensionChain, HookError, LoadDocumentPayload, StoreDocumentPayload,
};
use wiki_collab::storage::{
    MemoryStore, PageRecord, SpaceRecord, SpaceRole, SpaceVisibility, UserRecord, WorkspaceRole,
};
use wiki_collab::sync::SyncSettings;
use wiki_collab::{
    AuthenticationExtension, Authorizer, AwarenessSyncExtension, DocumentSyncExtension,
    PersistenceExtension, Replica, ResidentReplicas, TokenService,
};
use yrs::{TransactionMut, XmlElementPrelim, XmlFragment, XmlFragmentRef, XmlTextPrelim};

pub const SECRET: &str = "integration-secret";

/// Let spawned dispatch and subscriber tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Append `<paragraph>text</paragraph>` to the content fragment.
pub fn append_paragraph(txn: &mut TransactionMut, fragment: &XmlFragmentRef, text: &str) {
    let index = fragment.len(&*txn);
    let paragraph = fragment.insert(txn, index, XmlElementPrelim::empty("paragraph"));
    paragraph.insert(txn, 0, XmlTextPrelim::new(text));
}

/// Presence payload for a fresh awareness client; returns (client id, update).
pub fn presence(name: &str) -> (ClientId, Vec<u8>) {
    use yrs::sync::Awareness;
    use yrs::updates::encoder::Encode;

    let awareness = Awareness::new(yrs::Doc::new());
    let _ = awareness.set_local_state(serde_json::json!({ "user": { "name": name } }));
    let update = awareness.update().unwrap();
    (awareness.client_id(), update.encode_v1())
}

/// An authenticated session on a resident replica.
pub struct Session {
    pub document_name: String,
    pub replica: Arc<Replica>,
    pub context: AuthContext,
}

/// One simulated collab process.
pub struct TestHost {
    pub replicas: Arc<ResidentReplicas>,
    pub chain: ExtensionChain,
    pub document_sync: Option<Arc<DocumentSyncExtension>>,
    pub awareness_sync: Option<Arc<AwarenessSyncExtension>>,
    dispatchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TestHost {
    /// Register extensions in production order and configure them.
    pub async fn start(
        process_id: &str,
        store: Arc<MemoryStore>,
        cache: Arc<dyn SharedCache>,
        pubsub: Arc<dyn PubSub>,
        events: PageEvents,
        jobs: Option<Arc<JobQueue>>,
        with_sync: bool,
    ) -> Self {
        let authorizer = Arc::new(Authorizer::new(
            TokenService::new(SECRET),
            store.clone(),
            store.clone(),
        ));
        let mut chain = ExtensionChain::new()
            .with(Arc::new(AuthenticationExtension::new(authorizer)))
            .with(Arc::new(PersistenceExtension::new(store, events, jobs)));

        let (mut document_sync, mut awareness_sync) = (None, None);
        if with_sync {
            let config = CollabConfig {
                process_id: process_id.to_string(),
                ..CollabConfig::default()
            };
            let docs = Arc::new(DocumentSyncExtension::from_config(&config, cache, pubsub.clone()));
            let presence = Arc::new(AwarenessSyncExtension::new(
                SyncSettings {
                    process_id: config.process_id.clone(),
                    channel: config.awareness_channel.clone(),
                    debug: true,
                },
                pubsub,
            ));
            chain.push(docs.clone());
            chain.push(presence.clone());
            document_sync = Some(docs);
            awareness_sync = Some(presence);
        }

        let replicas = Arc::new(ResidentReplicas::new());
        chain.configure(replicas.clone()).await;
        Self {
            replicas,
            chain,
            document_sync,
            awareness_sync,
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate, make the document resident and load it on first open.
    pub async fn open(&self, document_name: &str, token: &str) -> Result<Session, HookError> {
        let context = self
            .chain
            .authenticate(&AuthenticatePayload {
                document_name: document_name.to_string(),
                token: token.to_string(),
            })
            .await?
            .expect("authentication extension always answers");

        let (replica, created) = self.replicas.get_or_create(document_name).await;
        if created {
            self.spawn_dispatcher(document_name, replica.clone()).await;
            self.chain
                .load_document(&LoadDocumentPayload {
                    document_name: document_name.to_string(),
                    replica: replica.clone(),
                    context: Some(context.clone()),
                })
                .await;
        }
        Ok(Session {
            document_name: document_name.to_string(),
            replica,
            context,
        })
    }

    async fn spawn_dispatcher(&self, document_name: &str, replica: Arc<Replica>) {
        let mut events = replica.subscribe();
        let chain = self.chain.clone();
        let name = document_name.to_string();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                chain.dispatch(&name, &replica, event).await;
            }
        });
        self.dispatchers
            .lock()
            .await
            .insert(document_name.to_string(), handle);
    }

    /// Local edit through a session, then let hooks run.
    pub async fn edit(&self, session: &Session, text: &str) -> Vec<u8> {
        let delta = session
            .replica
            .transact_local(Some(session.context.user_id), |txn, fragment| {
                append_paragraph(txn, fragment, text)
            });
        settle().await;
        delta
    }

    pub async fn checkpoint(&self, session: &Session) {
        self.chain
            .store_document(&StoreDocumentPayload {
                document_name: session.document_name.clone(),
                replica: session.replica.clone(),
                user: Some(session.context.user_id),
            })
            .await;
    }

    /// Last session left: checkpoint, drop the replica, fire the unload hook.
    pub async fn unload(&self, session: &Session) {
        self.checkpoint(session).await;
        self.replicas.remove(&session.document_name).await;
        if let Some(handle) = self.dispatchers.lock().await.remove(&session.document_name) {
            handle.abort();
        }
        self.chain.unload_document(&session.document_name).await;
    }

    pub async fn shutdown(&self) {
        for (_, handle) in self.dispatchers.lock().await.drain() {
            handle.abort();
        }
        self.chain.destroy().await;
    }
}

/// A workspace with one open space, one page and a writer.
pub struct Workspace {
    pub store: Arc<MemoryStore>,
    pub tokens: TokenService,
    pub workspace_id: Uuid,
    pub space_id: Uuid,
    pub page_id: Uuid,
    pub writer: Uuid,
}

impl Workspace {
    pub async fn seed() -> Self {
        Self::seed_with(SpaceVisibility::Open).await
    }

    pub async fn seed_with(visibility: SpaceVisibility) -> Self {
        let store = Arc::new(MemoryStore::new());
        let workspace_id = Uuid::new_v4();
        let space_id = Uuid::new_v4();
        store
            .insert_space(SpaceRecord {
                id: space_id,
                workspace_id,
                visibility,
                deleted_at: None,
            })
            .await;

        let writer = Uuid::new_v4();
        store
            .insert_user(UserRecord {
                id: writer,
                workspace_id,
                role: WorkspaceRole::Member,
                deactivated_at: None,
            })
            .await;
        store.add_member(writer, space_id, SpaceRole::Writer).await;

        let page = PageRecord::new(space_id, workspace_id, Some(writer));
        let page_id = page.id;
        store.insert_page(page).await;

        Self {
            store,
            tokens: TokenService::new(SECRET),
            workspace_id,
            space_id,
            page_id,
            writer,
        }
    }

    pub fn document_name(&self) -> String {
        format!("page.{}", self.page_id)
    }

    /// Add a workspace member, optionally with a space role.
    pub async fn add_user(&self, role: Option<SpaceRole>) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_user(UserRecord {
                id,
                workspace_id: self.workspace_id,
                role: WorkspaceRole::Member,
                deactivated_at: None,
            })
            .await;
        if let Some(role) = role {
            self.store.add_member(id, self.space_id, role).await;
        }
        id
    }

    pub fn token(&self, user: Uuid) -> String {
        self.tokens
            .issue_collab_token(user, self.workspace_id)
            .unwrap()
    }

    pub async fn page(&self) -> PageRecord {
        use wiki_collab::PageStore;
        self.store.find_page(self.page_id).await.unwrap().unwrap()
    }

    /// One host on a private bus with sync enabled.
    pub async fn host(&self, process_id: &str) -> TestHost {
        let bus = Arc::new(MemoryBus::new());
        TestHost::start(
            process_id,
            self.store.clone(),
            bus.clone(),
            bus,
            PageEvents::new(),
            None,
            true,
        )
        .await
    }
}

/// Two processes sharing one store and one bus.
pub struct Cluster {
    pub workspace: Workspace,
    pub bus: Arc<MemoryBus>,
    pub a: TestHost,
    pub b: TestHost,
}

impl Cluster {
    pub async fn start() -> Self {
        let workspace = Workspace::seed().await;
        let bus = Arc::new(MemoryBus::new());
        let a = TestHost::start(
            "process-a",
            workspace.store.clone(),
            bus.clone(),
            bus.clone(),
            PageEvents::new(),
            None,
            true,
        )
        .await;
        let b = TestHost::start(
            "process-b",
            workspace.store.clone(),
            bus.clone(),
            bus.clone(),
            PageEvents::new(),
            None,
            true,
        )
        .await;
        Self { workspace, bus, a, b }
    }
}

/// Soft-deleted `deleted_at` stamp.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
