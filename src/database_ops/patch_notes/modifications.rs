use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use tracing::{info, instrument};

use super::diff::{compute_diff, ChangeRecord};
use crate::database_ops::db::Db;

/// One edit of a patch note. Rows are append-only; moderation only flips `deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PatchNoteModification {
    pub id: i64,
    pub patch_note_id: i64,
    pub user_id: i64,
    pub diff: Json<ChangeRecord>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl PatchNoteModification {
    pub fn change_record(&self) -> &ChangeRecord {
        &self.diff.0
    }
}

pub struct ModificationStore {
    db: Db,
}

impl ModificationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Diffs the two revisions and appends the result. Returns `None` when
    /// the texts are identical.
    #[instrument(skip(self, old_text, new_text))]
    pub async fn record_edit(
        &self,
        patch_note_id: i64,
        user_id: i64,
        old_text: &str,
        new_text: &str,
    ) -> Result<Option<PatchNoteModification>> {
        let record = compute_diff(old_text, new_text);
        if !record.has_changes() {
            return Ok(None);
        }
        self.record(patch_note_id, user_id, &record).await.map(Some)
    }

    #[instrument(skip(self, record))]
    pub async fn record(
        &self,
        patch_note_id: i64,
        user_id: i64,
        record: &ChangeRecord,
    ) -> Result<PatchNoteModification> {
        let row = sqlx::query_as::<_, PatchNoteModification>(
            "INSERT INTO patch_note_modification (patch_note_id, user_id, diff)
             VALUES ($1, $2, $3)
             RETURNING id, patch_note_id, user_id, diff, created_at, deleted",
        )
        .persistent(false)
        .bind(patch_note_id)
        .bind(user_id)
        .bind(Json(record))
        .fetch_one(&self.db.pool)
        .await?;
        info!(target = "patch_notes", id = row.id, patch_note_id, "modification recorded");
        Ok(row)
    }

    /// Oldest first. Soft-deleted rows are included only when asked for.
    pub async fn list_for_patch_note(
        &self,
        patch_note_id: i64,
        include_deleted: bool,
    ) -> Result<Vec<PatchNoteModification>> {
        let rows = sqlx::query_as::<_, PatchNoteModification>(
            "SELECT id, patch_note_id, user_id, diff, created_at, deleted
             FROM patch_note_modification
             WHERE patch_note_id = $1 AND ($2 OR NOT deleted)
             ORDER BY created_at, id",
        )
        .persistent(false)
        .bind(patch_note_id)
        .bind(include_deleted)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Marks a modification deleted. Returns false when no live row matched.
    pub async fn soft_delete(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE patch_note_modification SET deleted = true WHERE id = $1 AND NOT deleted",
        )
        .persistent(false)
        .bind(id)
        .execute(&self.db.pool)
        .await?;
        let hit = res.rows_affected() > 0;
        if hit {
            info!(target = "patch_notes", id, "modification soft-deleted");
        }
        Ok(hit)
    }
}
