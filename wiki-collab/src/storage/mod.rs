//! Relational store behind the collaboration core.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  find_page / checkpoint_page  ┌──────────────┐
//! │ Persistence      │ ────────────────────────────► │ PageStore    │
//! │ Extension        │                               │  PgStore     │
//! └──────────────────┘                               │  MemoryStore │
//! ┌──────────────────┐  users / spaces / grants      ├──────────────┤
//! │ Authorizer       │ ────────────────────────────► │ AccessDir.   │
//! └──────────────────┘                               └──────────────┘
//! ```
//!
//! A checkpoint runs inside one row-locked transaction. The store hands the
//! locked page and its attachments to a planner closure; the planner decides
//! whether anything is written at all.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed column {column}: {reason}")]
    Decode { column: &'static str, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Space-level permission tier, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceRole {
    Reader,
    Writer,
    Admin,
}

impl SpaceRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reader" => Some(SpaceRole::Reader),
            "writer" => Some(SpaceRole::Writer),
            "admin" => Some(SpaceRole::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceRole::Reader => "reader",
            SpaceRole::Writer => "writer",
            SpaceRole::Admin => "admin",
        }
    }
}

/// Workspace-level role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    Owner,
    Admin,
    Member,
}

impl WorkspaceRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(WorkspaceRole::Owner),
            "admin" => Some(WorkspaceRole::Admin),
            "member" => Some(WorkspaceRole::Member),
            _ => None,
        }
    }

    /// Owners and admins manage every space in the workspace.
    pub fn is_admin(&self) -> bool {
        matches!(self, WorkspaceRole::Owner | WorkspaceRole::Admin)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub role: WorkspaceRole,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceVisibility {
    /// Every workspace member may edit.
    Open,
    Private,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub visibility: SpaceVisibility,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Page row as seen by the collaboration core.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub id: Uuid,
    pub space_id: Uuid,
    pub workspace_id: Uuid,
    pub creator_id: Option<Uuid>,
    /// Structured (ProseMirror JSON) content
    pub content: Option<Value>,
    pub text_content: Option<String>,
    /// Raw CRDT snapshot
    pub ydoc: Option<Vec<u8>>,
    pub contributor_ids: Vec<Uuid>,
    pub last_updated_by_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl PageRecord {
    /// A fresh page with no content.
    pub fn new(space_id: Uuid, workspace_id: Uuid, creator_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            space_id,
            workspace_id,
            creator_id,
            content: None,
            text_content: None,
            ydoc: None,
            contributor_ids: Vec::new(),
            last_updated_by_id: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub page_id: Uuid,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Page-level share addressed to a user or a group.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareGrant {
    pub page_id: Uuid,
    pub space_id: Uuid,
    pub user_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub role: SpaceRole,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ShareGrant {
    /// Not revoked and not past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none() && self.expires_at.is_none_or(|at| at > now)
    }
}

/// Everything a checkpoint writes, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct PageWrite {
    pub content: Value,
    pub text_content: String,
    pub ydoc: Vec<u8>,
    pub contributor_ids: Vec<Uuid>,
    pub last_updated_by_id: Option<Uuid>,
    /// Linked attachments no longer referenced by the content
    pub delete_attachments: Vec<Uuid>,
    /// Soft-deleted attachments referenced again
    pub restore_attachments: Vec<Uuid>,
}

/// Decides the write for a locked page, or `None` to abort.
pub type CheckpointPlanner<'a> =
    dyn Fn(&PageRecord, &[AttachmentRecord]) -> Option<PageWrite> + Send + Sync + 'a;

/// Result of a checkpoint transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    /// No such page.
    Missing,
    /// Planner aborted; nothing was written.
    Unchanged,
    /// Committed; carries the refreshed row.
    Written(PageRecord),
}

/// Page persistence.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn find_page(&self, page_id: Uuid) -> Result<Option<PageRecord>, StoreError>;

    /// Lock the page row, let `plan` decide, and apply its write atomically.
    async fn checkpoint_page(
        &self,
        page_id: Uuid,
        plan: &CheckpointPlanner<'_>,
    ) -> Result<CheckpointOutcome, StoreError>;
}

/// Read-only access data used to resolve permission tiers.
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    async fn find_user(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Option<UserRecord>, StoreError>;

    async fn find_space(&self, space_id: Uuid) -> Result<Option<SpaceRecord>, StoreError>;

    /// Roles held in the space directly or through any group.
    async fn membership_roles(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<SpaceRole>, StoreError>;

    /// Share grants on pages of the space addressed to the user or their groups.
    ///
    /// Expired or revoked grants are included; callers filter.
    async fn share_grants(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<ShareGrant>, StoreError>;
}
