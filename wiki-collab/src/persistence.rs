//! Durable store bridge: loads replicas from pages and checkpoints them back.
//!
//! Checkpoint flow:
//! ```text
//! replica ──► content JSON, plain text, full snapshot
//!               │
//!               ▼
//! PageStore::checkpoint_page (row locked)
//!   plan_checkpoint: content unchanged? ──yes──► abort (no write, no events)
//!                    │ no
//!                    ├─ attachments: soft-delete unreferenced, restore referenced
//!                    ├─ contributors: stored ∪ session set ∪ creator
//!                    └─ last editor: acting user, else previous
//!               │ commit
//!               ▼
//! clear session contributors ─► PageUpdated ─► BacklinkJob
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::content;
use crate::document::DocumentName;
use crate::events::{BacklinkJob, JobQueue, PageEvent, PageEvents};
use crate::hooks::{ChangePayload, Extension, HookError, LoadDocumentPayload, StoreDocumentPayload};
use crate::replica::Origin;
use crate::storage::{AttachmentRecord, CheckpointOutcome, PageRecord, PageStore, PageWrite};

/// Users with local edits since the last checkpoint, per document.
#[derive(Default)]
pub struct ContributorSets {
    sets: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl ContributorSets {
    pub async fn add(&self, document_name: &str, user_id: Uuid) {
        self.sets
            .write()
            .await
            .entry(document_name.to_string())
            .or_default()
            .insert(user_id);
    }

    pub async fn get(&self, document_name: &str) -> HashSet<Uuid> {
        self.sets
            .read()
            .await
            .get(document_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget the given users; edits recorded since the snapshot was taken stay.
    pub async fn remove_flushed(&self, document_name: &str, flushed: &HashSet<Uuid>) {
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(document_name) {
            set.retain(|id| !flushed.contains(id));
            if set.is_empty() {
                sets.remove(document_name);
            }
        }
    }

    pub async fn discard(&self, document_name: &str) {
        self.sets.write().await.remove(document_name);
    }
}

/// Projection of a replica at checkpoint time.
#[derive(Debug, Clone)]
pub struct Projection {
    pub content: Value,
    pub text: String,
    pub snapshot: Vec<u8>,
}

/// Decide the write for a locked page. `None` means the content is unchanged.
pub fn plan_checkpoint(
    page: &PageRecord,
    attachments: &[AttachmentRecord],
    projection: &Projection,
    contributors: &HashSet<Uuid>,
    acting_user: Option<Uuid>,
) -> Option<PageWrite> {
    if page.content.as_ref() == Some(&projection.content) {
        return None;
    }

    let referenced = content::attachment_ids(&projection.content);
    let delete_attachments = attachments
        .iter()
        .filter(|a| a.deleted_at.is_none() && !referenced.contains(&a.id))
        .map(|a| a.id)
        .collect();
    let restore_attachments = attachments
        .iter()
        .filter(|a| a.deleted_at.is_some() && referenced.contains(&a.id))
        .map(|a| a.id)
        .collect();

    Some(PageWrite {
        content: projection.content.clone(),
        text_content: projection.text.clone(),
        ydoc: projection.snapshot.clone(),
        contributor_ids: merge_contributors(&page.contributor_ids, contributors, page.creator_id),
        last_updated_by_id: acting_user.or(page.last_updated_by_id),
        delete_attachments,
        restore_attachments,
    })
}

/// Stored order first, then new ids (session set plus creator) sorted.
pub fn merge_contributors(
    stored: &[Uuid],
    session: &HashSet<Uuid>,
    creator: Option<Uuid>,
) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(stored.len() + session.len() + 1);
    let mut merged: Vec<Uuid> = stored.iter().copied().filter(|id| seen.insert(*id)).collect();

    let mut added: Vec<Uuid> = session
        .iter()
        .copied()
        .chain(creator)
        .filter(|id| !seen.contains(id))
        .collect();
    added.sort();
    added.dedup();
    merged.extend(added);
    merged
}

/// Loads and checkpoints replicas against the page store.
pub struct PersistenceExtension {
    pages: Arc<dyn PageStore>,
    events: PageEvents,
    jobs: Option<Arc<JobQueue>>,
    contributors: ContributorSets,
}

impl PersistenceExtension {
    pub fn new(pages: Arc<dyn PageStore>, events: PageEvents, jobs: Option<Arc<JobQueue>>) -> Self {
        Self {
            pages,
            events,
            jobs,
            contributors: ContributorSets::default(),
        }
    }

    pub async fn contributors(&self, document_name: &str) -> HashSet<Uuid> {
        self.contributors.get(document_name).await
    }

    fn page_id(document_name: &str) -> Option<Uuid> {
        let parsed = DocumentName::parse(document_name);
        if parsed.is_none() {
            log::warn!("Ignoring document with malformed name {document_name:?}");
        }
        parsed.map(|name| name.id)
    }
}

#[async_trait]
impl Extension for PersistenceExtension {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn on_load_document(&self, payload: &LoadDocumentPayload) -> Result<(), HookError> {
        if !payload.replica.is_empty() {
            return Ok(());
        }
        let Some(page_id) = Self::page_id(&payload.document_name) else {
            return Ok(());
        };

        let Some(page) = self.pages.find_page(page_id).await? else {
            log::warn!("Page {page_id} not found, leaving {} empty", payload.document_name);
            return Ok(());
        };

        match (&page.ydoc, &page.content) {
            (Some(snapshot), _) if !snapshot.is_empty() => {
                payload.replica.apply_delta(snapshot, Origin::RemoteSync, None)?;
                log::debug!("Loaded {} from stored snapshot", payload.document_name);
            }
            (_, Some(json)) => {
                payload.replica.import_content(json)?;
                log::debug!("Imported {} from stored content", payload.document_name);
            }
            _ => log::debug!("{} has no stored state", payload.document_name),
        }
        Ok(())
    }

    async fn on_change(&self, payload: &ChangePayload) -> Result<(), HookError> {
        if let (Origin::Local, Some(user)) = (payload.origin, payload.user) {
            self.contributors.add(&payload.document_name, user).await;
        }
        Ok(())
    }

    async fn on_store_document(&self, payload: &StoreDocumentPayload) -> Result<(), HookError> {
        let Some(page_id) = Self::page_id(&payload.document_name) else {
            return Ok(());
        };

        let content = payload.replica.content_json();
        let projection = Projection {
            text: content::plain_text(&content),
            content,
            snapshot: payload.replica.encode_full_state(),
        };
        let contributors = self.contributors.get(&payload.document_name).await;
        let acting_user = payload.user;

        let outcome = self
            .pages
            .checkpoint_page(page_id, &|page, attachments| {
                plan_checkpoint(page, attachments, &projection, &contributors, acting_user)
            })
            .await?;

        let page = match outcome {
            CheckpointOutcome::Written(page) => page,
            CheckpointOutcome::Unchanged => {
                log::debug!("Checkpoint of {} skipped, content unchanged", payload.document_name);
                return Ok(());
            }
            CheckpointOutcome::Missing => {
                log::warn!("Checkpoint of {} skipped, page {page_id} missing", payload.document_name);
                return Ok(());
            }
        };

        self.contributors
            .remove_flushed(&payload.document_name, &contributors)
            .await;
        log::debug!(
            "Checkpointed {} ({} contributors)",
            payload.document_name,
            page.contributor_ids.len()
        );

        let job = BacklinkJob {
            page_id: page.id,
            workspace_id: page.workspace_id,
            mentioned_page_ids: content::page_mentions(&projection.content),
        };
        self.events.publish(PageEvent::PageUpdated { page });
        match &self.jobs {
            Some(jobs) => jobs.enqueue(job).await,
            None => log::debug!(
                "No job queue, skipping backlink indexing for {}",
                payload.document_name
            ),
        }
        Ok(())
    }

    async fn after_unload_document(&self, document_name: &str) -> Result<(), HookError> {
        self.contributors.discard(document_name).await;
        Ok(())
    }
}
