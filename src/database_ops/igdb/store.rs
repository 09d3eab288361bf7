use async_trait::async_trait;
use indexmap::IndexMap;

use super::checkpoint::ImportCheckpoint;
use super::error::StoreUpsertError;
use super::kinds::{EntityKind, RelationKind};
use super::reconcile::{IdentifierMap, ResolvedBatch};
use super::record::{EntityRow, ExternalRecord};
use super::relations::{Pair, RelationDiff};

/// Relationship additions are inserted in chunks of this many pairs.
pub const RELATION_INSERT_CHUNK: usize = 100;

/// Insert-or-update access to the local relational store.
///
/// Writes happen between `begin_batch` and `commit_batch`; a failed batch is
/// undone in full with `rollback_batch`.
#[async_trait]
pub trait UpsertStore: Send {
    /// Bulk existence lookup: returns the internal ids of the given external ids that exist.
    async fn lookup_ids(
        &mut self,
        kind: EntityKind,
        external_ids: &[i64],
    ) -> Result<IdentifierMap, StoreUpsertError>;

    async fn begin_batch(&mut self) -> Result<(), StoreUpsertError>;

    /// Insert-or-update keyed on external id; every mutable field is overwritten
    /// and the last-updated timestamp refreshed. Returns the id of every row.
    async fn upsert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[EntityRow],
    ) -> Result<IdentifierMap, StoreUpsertError>;

    async fn existing_relationships(
        &mut self,
        relation: RelationKind,
        owner_ids: &[i64],
    ) -> Result<Vec<Pair>, StoreUpsertError>;

    /// Removes each stale pair with its own targeted delete, then inserts the
    /// additions in chunks of [`RELATION_INSERT_CHUNK`], skipping pairs that exist.
    async fn apply_relationship_changes(
        &mut self,
        relation: RelationKind,
        diff: &RelationDiff,
    ) -> Result<(), StoreUpsertError>;

    async fn commit_batch(&mut self) -> Result<(), StoreUpsertError>;

    async fn rollback_batch(&mut self) -> Result<(), StoreUpsertError>;

    /// Drops cached identities and reconnects. Must not be called while a batch is open.
    async fn reset(&mut self) -> Result<(), StoreUpsertError>;

    async fn load_checkpoint(&mut self) -> Result<ImportCheckpoint, StoreUpsertError>;

    async fn save_checkpoint(&mut self, checkpoint: &ImportCheckpoint)
        -> Result<(), StoreUpsertError>;
}

/// Upserts a resolved batch and extends `resolved.own` with store-assigned ids.
/// Returns the internal ids of entities that did not exist before.
pub async fn upsert_batch<S>(
    store: &mut S,
    kind: EntityKind,
    batch: &[ExternalRecord],
    resolved: &mut ResolvedBatch,
) -> Result<Vec<i64>, StoreUpsertError>
where
    S: UpsertStore + ?Sized,
{
    let parents = kind.spec().parent.and_then(|p| resolved.references(p));
    // Last occurrence of an external id wins.
    let mut rows: IndexMap<i64, EntityRow> = IndexMap::new();
    for record in batch {
        let parent_id = record
            .parent_game
            .and_then(|ext| parents.and_then(|m| m.get(&ext).copied()));
        rows.insert(record.id, EntityRow::from_record(kind, record, parent_id));
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<EntityRow> = rows.into_values().collect();
    let ids = store.upsert_entities(kind, &rows).await?;

    let mut created = Vec::new();
    for row in &rows {
        let Some(&id) = ids.get(&row.external_id) else {
            return Err(StoreUpsertError::Rejected {
                kind,
                external_id: row.external_id,
                reason: "upsert returned no id".into(),
            });
        };
        if resolved.own.insert(row.external_id, id).is_none() {
            created.push(id);
        }
    }
    Ok(created)
}
