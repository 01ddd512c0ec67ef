//! Postgres-backed store.
//!
//! Tables used (owned by the wiki's main schema):
//! ```text
//! pages        id, space_id, workspace_id, creator_id, content jsonb, text_content,
//!              ydoc bytea, contributor_ids uuid[], last_updated_by_id, updated_at
//! attachments  id, page_id, deleted_at
//! users        id, workspace_id, role, deactivated_at
//! spaces       id, workspace_id, visibility, deleted_at
//! space_members (user_id | group_id), space_id, role
//! group_users  user_id, group_id
//! page_shares  page_id, space_id, (user_id | group_id), role, expires_at, deleted_at
//! backlinks    source_page_id, target_page_id, workspace_id
//! ```
//!
//! Checkpoints lock the page row with `SELECT … FOR UPDATE` so concurrent
//! checkpoints from different processes serialize on the row.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::events::{BacklinkIndexer, BacklinkJob, IndexError};

use super::{
    AccessDirectory, AttachmentRecord, CheckpointOutcome, CheckpointPlanner, PageRecord,
    PageStore, ShareGrant, SpaceRecord, SpaceRole, SpaceVisibility, StoreError, UserRecord,
    WorkspaceRole,
};

const PAGE_COLUMNS: &str = "id, space_id, workspace_id, creator_id, content, text_content, \
                            ydoc, contributor_ids, last_updated_by_id, updated_at";

/// Pool size for the collaboration process.
const MAX_CONNECTIONS: u32 = 10;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        log::info!("Connected to Postgres ({MAX_CONNECTIONS} connections)");
        Ok(Self { pool })
    }

    /// Reuse a pool owned by the embedding application.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn page_from_row(row: &PgRow) -> Result<PageRecord, StoreError> {
    Ok(PageRecord {
        id: row.try_get("id")?,
        space_id: row.try_get("space_id")?,
        workspace_id: row.try_get("workspace_id")?,
        creator_id: row.try_get("creator_id")?,
        content: row.try_get("content")?,
        text_content: row.try_get("text_content")?,
        ydoc: row.try_get("ydoc")?,
        contributor_ids: row
            .try_get::<Option<Vec<Uuid>>, _>("contributor_ids")?
            .unwrap_or_default(),
        last_updated_by_id: row.try_get("last_updated_by_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attachment_from_row(row: &PgRow) -> Result<AttachmentRecord, StoreError> {
    Ok(AttachmentRecord {
        id: row.try_get("id")?,
        page_id: row.try_get("page_id")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn space_role(row: &PgRow) -> Result<SpaceRole, StoreError> {
    let raw: String = row.try_get("role")?;
    SpaceRole::parse(&raw).ok_or(StoreError::Decode {
        column: "role",
        reason: format!("unknown space role {raw:?}"),
    })
}

#[async_trait]
impl PageStore for PgStore {
    async fn find_page(&self, page_id: Uuid) -> Result<Option<PageRecord>, StoreError> {
        let query = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&query)
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(page_from_row).transpose()
    }

    async fn checkpoint_page(
        &self,
        page_id: Uuid,
        plan: &CheckpointPlanner<'_>,
    ) -> Result<CheckpointOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let page = match sqlx::query(&select)
            .bind(page_id)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => page_from_row(&row)?,
            None => {
                tx.rollback().await?;
                return Ok(CheckpointOutcome::Missing);
            }
        };

        let attachments = sqlx::query("SELECT id, page_id, deleted_at FROM attachments WHERE page_id = $1")
            .bind(page_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(attachment_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let write = match plan(&page, &attachments) {
            Some(write) => write,
            None => {
                tx.rollback().await?;
                return Ok(CheckpointOutcome::Unchanged);
            }
        };

        if !write.delete_attachments.is_empty() {
            sqlx::query("UPDATE attachments SET deleted_at = now() WHERE id = ANY($1)")
                .bind(&write.delete_attachments)
                .execute(&mut *tx)
                .await?;
        }
        if !write.restore_attachments.is_empty() {
            sqlx::query("UPDATE attachments SET deleted_at = NULL WHERE id = ANY($1)")
                .bind(&write.restore_attachments)
                .execute(&mut *tx)
                .await?;
        }

        let update = format!(
            "UPDATE pages SET content = $2, text_content = $3, ydoc = $4, contributor_ids = $5, \
             last_updated_by_id = $6, updated_at = now() WHERE id = $1 RETURNING {PAGE_COLUMNS}"
        );
        let row = sqlx::query(&update)
            .bind(page_id)
            .bind(&write.content)
            .bind(&write.text_content)
            .bind(&write.ydoc)
            .bind(&write.contributor_ids)
            .bind(write.last_updated_by_id)
            .fetch_one(&mut *tx)
            .await?;
        let updated = page_from_row(&row)?;

        tx.commit().await?;
        Ok(CheckpointOutcome::Written(updated))
    }
}

/// Replaces the outgoing links of the job's page. Targets outside the
/// page's workspace or already deleted are skipped.
#[async_trait]
impl BacklinkIndexer for PgStore {
    async fn index(&self, job: &BacklinkJob) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query("DELETE FROM backlinks WHERE source_page_id = $1")
            .bind(job.page_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        if !job.mentioned_page_ids.is_empty() {
            sqlx::query(
                "INSERT INTO backlinks (source_page_id, target_page_id, workspace_id) \
                 SELECT $1, id, workspace_id FROM pages \
                 WHERE id = ANY($3) AND workspace_id = $2 AND id <> $1 AND deleted_at IS NULL \
                 ON CONFLICT DO NOTHING",
            )
            .bind(job.page_id)
            .bind(job.workspace_id)
            .bind(&job.mentioned_page_ids)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl AccessDirectory for PgStore {
    async fn find_user(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, role, deactivated_at FROM users \
             WHERE id = $1 AND workspace_id = $2 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw_role: String = row.try_get("role")?;
        let role = WorkspaceRole::parse(&raw_role).ok_or(StoreError::Decode {
            column: "role",
            reason: format!("unknown workspace role {raw_role:?}"),
        })?;
        Ok(Some(UserRecord {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            role,
            deactivated_at: row.try_get("deactivated_at")?,
        }))
    }

    async fn find_space(&self, space_id: Uuid) -> Result<Option<SpaceRecord>, StoreError> {
        let row = sqlx::query("SELECT id, workspace_id, visibility, deleted_at FROM spaces WHERE id = $1")
            .bind(space_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let visibility: String = row.try_get("visibility")?;
        Ok(Some(SpaceRecord {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            visibility: if visibility == "open" {
                SpaceVisibility::Open
            } else {
                SpaceVisibility::Private
            },
            deleted_at: row.try_get("deleted_at")?,
        }))
    }

    async fn membership_roles(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<SpaceRole>, StoreError> {
        sqlx::query(
            "SELECT role FROM space_members WHERE space_id = $2 AND \
             (user_id = $1 OR group_id IN (SELECT group_id FROM group_users WHERE user_id = $1))",
        )
        .bind(user_id)
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(space_role)
        .collect()
    }

    async fn share_grants(
        &self,
        user_id: Uuid,
        space_id: Uuid,
    ) -> Result<Vec<ShareGrant>, StoreError> {
        let rows = sqlx::query(
            "SELECT page_id, space_id, user_id, group_id, role, expires_at, deleted_at \
             FROM page_shares WHERE space_id = $2 AND \
             (user_id = $1 OR group_id IN (SELECT group_id FROM group_users WHERE user_id = $1))",
        )
        .bind(user_id)
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ShareGrant, StoreError> {
                Ok(ShareGrant {
                    page_id: row.try_get("page_id")?,
                    space_id: row.try_get("space_id")?,
                    user_id: row.try_get("user_id")?,
                    group_id: row.try_get("group_id")?,
                    role: space_role(row)?,
                    expires_at: row.try_get("expires_at")?,
                    deleted_at: row.try_get("deleted_at")?,
                })
            })
            .collect()
    }
}
