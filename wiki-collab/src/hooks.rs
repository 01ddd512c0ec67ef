//! Lifecycle hook contract between the replica host and the core.
//!
//! ```text
//!   host ──► ExtensionChain ──► [Authentication, Persistence, DocumentSync, AwarenessSync]
//!                 │                  (registration order = dispatch order)
//!                 └── authenticate: first context wins, first error refuses
//!                     everything else: every extension runs, failures are logged
//! ```
//!
//! Every hook is defaulted to a no-op so an extension implements only the
//! triggers it cares about.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::{AuthContext, AuthError};
use crate::bus::BusError;
use crate::replica::{ClientId, Origin, Replica, ReplicaError, ReplicaEvent, ReplicaRegistry};
use crate::storage::StoreError;

/// Errors surfaced by hooks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

#[derive(Debug, Clone)]
pub struct AuthenticatePayload {
    pub document_name: String,
    pub token: String,
}

#[derive(Clone)]
pub struct LoadDocumentPayload {
    pub document_name: String,
    pub replica: Arc<Replica>,
    /// Context of the session that triggered the load, if any
    pub context: Option<AuthContext>,
}

#[derive(Clone)]
pub struct ChangePayload {
    pub document_name: String,
    pub replica: Arc<Replica>,
    pub update: Arc<Vec<u8>>,
    pub origin: Origin,
    pub user: Option<Uuid>,
}

#[derive(Clone)]
pub struct AwarenessUpdatePayload {
    pub document_name: String,
    pub replica: Arc<Replica>,
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: Origin,
}

#[derive(Clone)]
pub struct StoreDocumentPayload {
    pub document_name: String,
    pub replica: Arc<Replica>,
    /// User whose session triggered the checkpoint
    pub user: Option<Uuid>,
}

/// Callbacks a replica host invokes.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Host is up; `registry` resolves resident replicas by name.
    async fn on_configure(&self, _registry: Arc<dyn ReplicaRegistry>) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_authenticate(
        &self,
        _payload: &AuthenticatePayload,
    ) -> Result<Option<AuthContext>, HookError> {
        Ok(None)
    }

    async fn on_load_document(&self, _payload: &LoadDocumentPayload) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_change(&self, _payload: &ChangePayload) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_awareness_update(
        &self,
        _payload: &AwarenessUpdatePayload,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_store_document(&self, _payload: &StoreDocumentPayload) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_unload_document(&self, _document_name: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Ordered extension list a host dispatches through.
#[derive(Default, Clone)]
pub struct ExtensionChain {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn push(&mut self, extension: Arc<dyn Extension>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Extension names in dispatch order.
    pub fn names(&self) -> Vec<&'static str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    pub async fn configure(&self, registry: Arc<dyn ReplicaRegistry>) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_configure(registry.clone()).await {
                log::error!("{} failed to configure: {e}", extension.name());
            }
        }
    }

    /// First extension returning a context admits the session.
    pub async fn authenticate(
        &self,
        payload: &AuthenticatePayload,
    ) -> Result<Option<AuthContext>, HookError> {
        for extension in &self.extensions {
            if let Some(context) = extension.on_authenticate(payload).await? {
                return Ok(Some(context));
            }
        }
        Ok(None)
    }

    pub async fn load_document(&self, payload: &LoadDocumentPayload) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_load_document(payload).await {
                log::error!(
                    "{} failed to load {}: {e}",
                    extension.name(),
                    payload.document_name
                );
            }
        }
    }

    pub async fn change(&self, payload: &ChangePayload) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_change(payload).await {
                log::error!(
                    "{} change hook failed for {}: {e}",
                    extension.name(),
                    payload.document_name
                );
            }
        }
    }

    pub async fn awareness_update(&self, payload: &AwarenessUpdatePayload) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_awareness_update(payload).await {
                log::error!(
                    "{} awareness hook failed for {}: {e}",
                    extension.name(),
                    payload.document_name
                );
            }
        }
    }

    pub async fn store_document(&self, payload: &StoreDocumentPayload) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_store_document(payload).await {
                log::error!(
                    "{} failed to store {}: {e}",
                    extension.name(),
                    payload.document_name
                );
            }
        }
    }

    pub async fn unload_document(&self, document_name: &str) {
        for extension in &self.extensions {
            if let Err(e) = extension.after_unload_document(document_name).await {
                log::error!("{} unload hook failed for {document_name}: {e}", extension.name());
            }
        }
    }

    pub async fn destroy(&self) {
        for extension in &self.extensions {
            if let Err(e) = extension.on_destroy().await {
                log::error!("{} failed to shut down: {e}", extension.name());
            }
        }
    }

    /// Route a replica notification to the matching hook.
    pub async fn dispatch(&self, document_name: &str, replica: &Arc<Replica>, event: ReplicaEvent) {
        match event {
            ReplicaEvent::Changed {
                update,
                origin,
                user,
            } => {
                self.change(&ChangePayload {
                    document_name: document_name.to_string(),
                    replica: replica.clone(),
                    update,
                    origin,
                    user,
                })
                .await
            }
            ReplicaEvent::Awareness { change, origin } => {
                self.awareness_update(&AwarenessUpdatePayload {
                    document_name: document_name.to_string(),
                    replica: replica.clone(),
                    added: change.added,
                    updated: change.updated,
                    removed: change.removed,
                    origin,
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SpaceRole;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        changes: AtomicUsize,
        admit: bool,
    }

    impl Counting {
        fn new(name: &'static str, admit: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                changes: AtomicUsize::new(0),
                admit,
            })
        }
    }

    #[async_trait]
    impl Extension for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_authenticate(
            &self,
            _payload: &AuthenticatePayload,
        ) -> Result<Option<AuthContext>, HookError> {
            if !self.admit {
                return Ok(None);
            }
            Ok(Some(AuthContext {
                user_id: Uuid::nil(),
                workspace_id: Uuid::nil(),
                role: SpaceRole::Writer,
                read_only: false,
            }))
        }

        async fn on_change(&self, _payload: &ChangePayload) -> Result<(), HookError> {
            self.changes.fetch_add(1, Ordering::SeqCst);
            Err(HookError::Replica(ReplicaError::Apply("boom".into())))
        }
    }

    fn payload() -> AuthenticatePayload {
        AuthenticatePayload {
            document_name: "page.x".into(),
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_authenticate_first_context_wins() {
        let chain = ExtensionChain::new()
            .with(Counting::new("silent", false))
            .with(Counting::new("admit", true));
        assert!(chain.authenticate(&payload()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticate_none_when_nobody_admits() {
        let chain = ExtensionChain::new().with(Counting::new("silent", false));
        assert!(chain.authenticate(&payload()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_chain() {
        let first = Counting::new("first", false);
        let second = Counting::new("second", false);
        let chain = ExtensionChain::new()
            .with(first.clone())
            .with(second.clone());

        let replica = Arc::new(Replica::new());
        chain
            .dispatch(
                "page.x",
                &replica,
                ReplicaEvent::Changed {
                    update: Arc::new(Vec::new()),
                    origin: Origin::Local,
                    user: None,
                },
            )
            .await;

        assert_eq!(first.changes.load(Ordering::SeqCst), 1);
        assert_eq!(second.changes.load(Ordering::SeqCst), 1);
        assert_eq!(chain.names(), vec!["first", "second"]);
    }
}
