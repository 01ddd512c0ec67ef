//! In-memory store for tests and single-node development.
//!
//! A single mutex stands in for the row lock: checkpoints are serialized
//! store-wide. Committed checkpoints are counted so callers can assert on
//! write amplification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::{BacklinkIndexer, BacklinkJob, IndexError};

use super::{
    AccessDirectory, AttachmentRecord, CheckpointOutcome, CheckpointPlanner, PageRecord,
    PageStore, ShareGrant, SpaceRecord, SpaceRole, StoreError, UserRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    spaces: HashMap<Uuid, SpaceRecord>,
    pages: HashMap<Uuid, PageRecord>,
    attachments: HashMap<Uuid, AttachmentRecord>,
    /// (user, space) → direct role
    members: HashMap<(Uuid, Uuid), SpaceRole>,
    /// (group, space) → role
    group_members: HashMap<(Uuid, Uuid), SpaceRole>,
    /// user → groups
    groups: HashMap<Uuid, Vec<Uuid>>,
    shares: Vec<ShareGrant>,
    /// source page → linked pages
    backlinks: HashMap<Uuid, Vec<Uuid>>,
}

impl Tables {
    fn groups_of(&self, user_id: Uuid) -> &[Uuid] {
        self.groups.get(&user_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Mutex-guarded tables implementing both store traits.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    page_writes: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            page_writes: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed checkpoint writes.
    pub fn page_writes(&self) -> u64 {
        self.page_writes.load(Ordering::Relaxed)
    }

    /// Simulate a database outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    // ─── Seeding ──────────────────────────────────────────────────────

    pub async fn insert_user(&self, user: UserRecord) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_space(&self, space: SpaceRecord) {
        self.tables.lock().await.spaces.insert(space.id, space);
    }

    pub async fn insert_page(&self, page: PageRecord) {
        self.tables.lock().await.pages.insert(page.id, page);
    }

    pub async fn insert_attachment(&self, attachment: AttachmentRecord) {
        self.tables
            .lock()
            .await
            .attachments
            .insert(attachment.id, attachment);
    }

    pub async fn add_member(&self, user_id: Uuid, space_id: Uuid, role: SpaceRole) {
        self.tables
            .lock()
            .await
            .members
            .insert((user_id, space_id), role);
    }

    pub async fn add_group_member(
        &self,
        user_id: Uuid,
        group_id: Uuid,
        space_id: Uuid,
        role: SpaceRole,
    ) {
        let mut tables = self.tables.lock().await;
        tables.groups.entry(user_id).or_default().push(group_id);
        tables.group_members.insert((group_id, space_id), role);
    }

    pub async fn add_share(&self, grant: ShareGrant) {
        self.tables.lock().await.shares.push(grant);
    }

    pub async fn attachment(&self, id: Uuid) -> Option<AttachmentRecord> {
        self.tables.lock().await.attachments.get(&id).cloned()
    }

    /// Pages linked from `page_id` by the last indexed backlink job.
    pub async fn links_from(&self, page_id: Uuid) -> Vec<Uuid> {
        self.tables
            .lock()
            .await
            .backlinks
            .get(&page_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BacklinkIndexer for MemoryStore {
    async fn index(&self, job: &BacklinkJob) -> Result<(), IndexError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let targets: Vec<Uuid> = job
            .mentioned_page_ids
            .iter()
            .copied()
            .filter(|id| *id != job.page_id)
            .filter(|id| {
                tables
                    .pages
                    .get(id)
                    .is_some_and(|page| page.workspace_id == job.workspace_id)
            })
            .collect();
        tables.backlinks.insert(job.page_id, targets);
        Ok(())
    }
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn find_page(&self, page_id: Uuid) -> Result<Option<PageRecord>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.pages.get(&page_id).cloned())
    }

    async fn checkpoint_page(
        &self,
        page_id: Uuid,
        plan: &CheckpointPlanner<'_>,
    ) -> Result<CheckpointOutcome, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;

        let page = match tables.pages.get(&page_id) {
            Some(page) => page.clone(),
            None => return Ok(CheckpointOutcome::Missing),
        };
        let attachments: Vec<AttachmentRecord> = tables
            .attachments
            .values()
            .filter(|a| a.page_id == page_id)
            .cloned()
            .collect();

        let write = match plan(&page, &attachments) {
            Some(write) => write,
            None => return Ok(CheckpointOutcome::Unchanged),
        };

        let now = Utc::now();
        for id in &write.delete_attachments {
            if let Some(attachment) = tables.attachments.get_mut(id) {
                attachment.deleted_at = Some(now);
            }
        }
        for id in &write.restore_attachments {
            if let Some(attachment) = tables.attachments.get_mut(id) {
                attachment.deleted_at = None;
            }
        }

        let updated = PageRecord {
            content: Some(write.content),
            text_content: Some(write.text_content),
            ydoc: Some(write.ydoc),
            contributor_ids: write.contributor_ids,
            last_updated_by_id: write.last_updated_by_id,
            updated_at: now,
            ..page
        };
        tables.pages.insert(page_id, updated.clone());
        self.page_writes.fetch_add(1, Ordering::Relaxed);

        Ok(CheckpointOutcome::Written(updated))
    }
}

#[async_trait]
impl AccessDirectory for MemoryStore {
    async fn find_user(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .users
            .get(&user_id)
            .filter(|u| u.workspace_id == workspace_id)
            .cloned())
    }

    async fn find_space(&self, space_id: Uuid) -> Result<Option<SpaceRecord>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.spaces.get(&space_id).cloned())
    }

    async fn membership_roles(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<SpaceRole>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut roles: Vec<SpaceRole> = tables
            .members
            .get(&(user_id, space_id))
            .copied()
            .into_iter()
            .collect();
        for group in tables.groups_of(user_id) {
            if let Some(role) = tables.group_members.get(&(*group, space_id)) {
                roles.push(*role);
            }
        }
        Ok(roles)
    }

    async fn share_grants(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<ShareGrant>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let groups = tables.groups_of(user_id);
        Ok(tables
            .shares
            .iter()
            .filter(|g| g.space_id == space_id)
            .filter(|g| {
                g.user_id == Some(user_id) || g.group_id.is_some_and(|id| groups.contains(&id))
            })
            .cloned()
            .collect())
    }
}
