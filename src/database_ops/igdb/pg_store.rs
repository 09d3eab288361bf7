//! Postgres-backed [`UpsertStore`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use super::checkpoint::ImportCheckpoint;
use super::error::StoreUpsertError;
use super::kinds::{EntityKind, RelationKind, UpsertColumn};
use super::reconcile::IdentifierMap;
use super::record::EntityRow;
use super::relations::{Pair, RelationDiff};
use super::store::{UpsertStore, RELATION_INSERT_CHUNK};
use crate::database_ops::db::Db;

/// Entity rows per multi-row upsert statement.
const ENTITY_UPSERT_CHUNK: usize = 100;

pub struct PgStore {
    db: Db,
    tx: Option<Transaction<'static, Postgres>>,
    /// (kind, external id) -> internal id, dropped on `reset`.
    identity: HashMap<(EntityKind, i64), i64>,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            tx: None,
            identity: HashMap::new(),
        }
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreUpsertError> {
        self.tx
            .as_mut()
            .ok_or(StoreUpsertError::BatchState("write outside of an open batch"))
    }
}

fn push_column_value<'a>(
    b: &mut sqlx::query_builder::Separated<'_, 'a, Postgres, &'static str>,
    column: UpsertColumn,
    row: &'a EntityRow,
) {
    match column {
        UpsertColumn::Name => b.push_bind(&row.name),
        UpsertColumn::Description => b.push_bind(&row.description),
        UpsertColumn::ReleaseDate => b.push_bind(row.release_date),
        UpsertColumn::ImageUrl => b.push_bind(&row.image_url),
        UpsertColumn::ParentId => b.push_bind(row.parent_id),
    };
}

/// `INSERT ... ON CONFLICT (igdb_id) DO UPDATE ... RETURNING igdb_id, id` for one chunk.
fn entity_upsert_query<'a>(kind: EntityKind, rows: &'a [EntityRow]) -> QueryBuilder<'a, Postgres> {
    let spec = kind.spec();
    let columns: Vec<&str> = spec.columns.iter().map(|c| c.column_name()).collect();
    let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} (igdb_id, {}, updated_at) ",
        spec.table,
        columns.join(", ")
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.external_id);
        for column in spec.columns {
            push_column_value(&mut b, *column, row);
        }
        b.push("now()");
    });
    let updates: Vec<String> = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    qb.push(format!(
        " ON CONFLICT (igdb_id) DO UPDATE SET {}, updated_at = now() RETURNING igdb_id, id",
        updates.join(", ")
    ));
    qb
}

#[async_trait]
impl UpsertStore for PgStore {
    #[instrument(skip(self, external_ids), fields(n = external_ids.len()))]
    async fn lookup_ids(
        &mut self,
        kind: EntityKind,
        external_ids: &[i64],
    ) -> Result<IdentifierMap, StoreUpsertError> {
        let mut found = IdentifierMap::new();
        let mut missing = Vec::new();
        for ext in external_ids {
            match self.identity.get(&(kind, *ext)) {
                Some(id) => {
                    found.insert(*ext, *id);
                }
                None => missing.push(*ext),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }
        let sql = format!(
            "SELECT igdb_id, id FROM {} WHERE igdb_id = ANY($1)",
            kind.spec().table
        );
        let query = sqlx::query_as::<_, (i64, i64)>(&sql)
            .persistent(false)
            .bind(&missing);
        // Lookups inside a batch must see the batch's own writes.
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.db.pool).await,
        }
        .map_err(StoreUpsertError::database(format!("{kind} lookup")))?;
        for (ext, id) in rows {
            found.insert(ext, id);
        }
        Ok(found)
    }

    async fn begin_batch(&mut self) -> Result<(), StoreUpsertError> {
        if self.tx.is_some() {
            return Err(StoreUpsertError::BatchState("batch already open"));
        }
        let tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(StoreUpsertError::database("begin batch"))?;
        self.tx = Some(tx);
        Ok(())
    }

    #[instrument(skip(self, rows), fields(n = rows.len()))]
    async fn upsert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[EntityRow],
    ) -> Result<IdentifierMap, StoreUpsertError> {
        let tx = self.tx()?;
        let mut ids = IdentifierMap::new();
        for chunk in rows.chunks(ENTITY_UPSERT_CHUNK) {
            let mut qb = entity_upsert_query(kind, chunk);
            let returned = qb
                .build()
                .persistent(false)
                .fetch_all(&mut **tx)
                .await
                .map_err(StoreUpsertError::database(format!("{kind} upsert")))?;
            for row in returned {
                let ext: i64 = row
                    .try_get(0)
                    .map_err(StoreUpsertError::database(format!("{kind} upsert")))?;
                let id: i64 = row
                    .try_get(1)
                    .map_err(StoreUpsertError::database(format!("{kind} upsert")))?;
                ids.insert(ext, id);
            }
        }
        // Rollback clears these.
        for (ext, id) in &ids {
            self.identity.insert((kind, *ext), *id);
        }
        Ok(ids)
    }

    async fn existing_relationships(
        &mut self,
        relation: RelationKind,
        owner_ids: &[i64],
    ) -> Result<Vec<Pair>, StoreUpsertError> {
        if owner_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {owner}, {target} FROM {table} WHERE {owner} = ANY($1)",
            owner = relation.owner_column(),
            target = relation.target_column(),
            table = relation.table(),
        );
        let tx = self.tx()?;
        sqlx::query_as::<_, (i64, i64)>(&sql)
            .persistent(false)
            .bind(owner_ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(StoreUpsertError::database(format!("{relation} read")))
    }

    #[instrument(skip(self, diff), fields(add = diff.to_add.len(), remove = diff.to_remove.len()))]
    async fn apply_relationship_changes(
        &mut self,
        relation: RelationKind,
        diff: &RelationDiff,
    ) -> Result<(), StoreUpsertError> {
        let owner = relation.owner_column();
        let target = relation.target_column();
        let table = relation.table();
        let tx = self.tx()?;

        let delete_sql = format!("DELETE FROM {table} WHERE {owner} = $1 AND {target} = $2");
        for (owner_id, target_id) in &diff.to_remove {
            sqlx::query(&delete_sql)
                .persistent(false)
                .bind(owner_id)
                .bind(target_id)
                .execute(&mut **tx)
                .await
                .map_err(StoreUpsertError::database(format!("{relation} delete")))?;
        }

        for chunk in diff.to_add.chunks(RELATION_INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({owner}, {target}) "));
            qb.push_values(chunk, |mut b, (owner_id, target_id)| {
                b.push_bind(*owner_id).push_bind(*target_id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build()
                .persistent(false)
                .execute(&mut **tx)
                .await
                .map_err(StoreUpsertError::database(format!("{relation} insert")))?;
        }
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<(), StoreUpsertError> {
        let tx = self
            .tx
            .take()
            .ok_or(StoreUpsertError::BatchState("commit without an open batch"))?;
        tx.commit()
            .await
            .map_err(StoreUpsertError::database("commit batch"))
    }

    async fn rollback_batch(&mut self) -> Result<(), StoreUpsertError> {
        let tx = self
            .tx
            .take()
            .ok_or(StoreUpsertError::BatchState("rollback without an open batch"))?;
        // Ids cached during the batch may point at rows that no longer exist.
        self.identity.clear();
        tx.rollback()
            .await
            .map_err(StoreUpsertError::database("rollback batch"))
    }

    async fn reset(&mut self) -> Result<(), StoreUpsertError> {
        if self.tx.is_some() {
            return Err(StoreUpsertError::BatchState("reset while a batch is open"));
        }
        let dropped = self.identity.len();
        self.identity = HashMap::new();
        self.db
            .reconnect()
            .await
            .map_err(|e| StoreUpsertError::Reconnect(e.to_string()))?;
        info!(target = "igdb", dropped, "store reset");
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> Result<ImportCheckpoint, StoreUpsertError> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT last_imported_at FROM igdb_import_checkpoint WHERE id = 1",
        )
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(StoreUpsertError::database("load checkpoint"))?;
        Ok(ImportCheckpoint {
            last_imported_at: last,
        })
    }

    async fn save_checkpoint(
        &mut self,
        checkpoint: &ImportCheckpoint,
    ) -> Result<(), StoreUpsertError> {
        let Some(at) = checkpoint.last_imported_at else {
            debug!(target = "igdb", "empty checkpoint, nothing to save");
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO igdb_import_checkpoint (id, last_imported_at) VALUES (1, $1)
             ON CONFLICT (id) DO UPDATE SET last_imported_at = EXCLUDED.last_imported_at",
        )
        .persistent(false)
        .bind(at)
        .execute(&self.db.pool)
        .await
        .map_err(StoreUpsertError::database("save checkpoint"))?;
        Ok(())
    }
}
