//! In-process [`UpsertStore`] backing `--dry-run` imports and the test suite.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::checkpoint::ImportCheckpoint;
use super::error::StoreUpsertError;
use super::kinds::{EntityKind, RelationKind};
use super::reconcile::IdentifierMap;
use super::record::{EntityRow, LocalEntity};
use super::relations::{apply_to_set, Pair, RelationDiff};
use super::store::{UpsertStore, RELATION_INSERT_CHUNK};

#[derive(Debug, Default)]
struct State {
    entities: HashMap<EntityKind, BTreeMap<i64, LocalEntity>>,
    relations: HashMap<RelationKind, HashSet<Pair>>,
    next_id: i64,
    checkpoint: ImportCheckpoint,
}

/// One write of the open batch, replayed in reverse on rollback.
#[derive(Debug)]
enum Undo {
    Entity {
        kind: EntityKind,
        external_id: i64,
        prior: Option<LocalEntity>,
    },
    PairAdded(RelationKind, Pair),
    PairRemoved(RelationKind, Pair),
}

#[derive(Debug)]
struct OpenBatch {
    next_id: i64,
    undo: Vec<Undo>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,
    batch: Option<OpenBatch>,
    lookup_calls: HashMap<EntityKind, usize>,
    pair_deletes: usize,
    insert_chunks: usize,
    resets: usize,
    committed_batches: usize,
    rolled_back_batches: usize,
    fail_on_external_id: Option<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: State {
                next_id: 1,
                ..State::default()
            },
            ..Self::default()
        }
    }

    /// Inserts an entity with a fixed internal id.
    pub fn seed(&mut self, kind: EntityKind, external_id: i64, id: i64) {
        let entity = LocalEntity {
            id,
            external_id,
            name: format!("seeded {kind} {external_id}"),
            description: None,
            release_date: None,
            image_url: None,
            parent_id: None,
            last_updated_at: Utc::now(),
        };
        self.state
            .entities
            .entry(kind)
            .or_default()
            .insert(external_id, entity);
        self.state.next_id = self.state.next_id.max(id + 1);
    }

    pub fn seed_relation(&mut self, relation: RelationKind, pair: Pair) {
        self.state.relations.entry(relation).or_default().insert(pair);
    }

    /// Makes every upsert containing this external id fail.
    pub fn fail_on(&mut self, external_id: i64) {
        self.fail_on_external_id = Some(external_id);
    }

    pub fn entity(&self, kind: EntityKind, external_id: i64) -> Option<&LocalEntity> {
        self.state.entities.get(&kind)?.get(&external_id)
    }

    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.state.entities.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn entities(&self, kind: EntityKind) -> Vec<&LocalEntity> {
        self.state
            .entities
            .get(&kind)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    pub fn relation_pairs(&self, relation: RelationKind) -> BTreeSet<Pair> {
        self.state
            .relations
            .get(&relation)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn lookup_calls(&self, kind: EntityKind) -> usize {
        self.lookup_calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn pair_deletes(&self) -> usize {
        self.pair_deletes
    }

    pub fn insert_chunks(&self) -> usize {
        self.insert_chunks
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn committed_batches(&self) -> usize {
        self.committed_batches
    }

    pub fn rolled_back_batches(&self) -> usize {
        self.rolled_back_batches
    }

    /// Undo entries recorded by the open batch.
    pub fn pending_undo(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.undo.len())
    }

    fn open_batch(&mut self) -> Result<&mut OpenBatch, StoreUpsertError> {
        self.batch
            .as_mut()
            .ok_or(StoreUpsertError::BatchState("write outside of an open batch"))
    }
}

#[async_trait]
impl UpsertStore for MemoryStore {
    async fn lookup_ids(
        &mut self,
        kind: EntityKind,
        external_ids: &[i64],
    ) -> Result<IdentifierMap, StoreUpsertError> {
        *self.lookup_calls.entry(kind).or_default() += 1;
        let table = self.state.entities.get(&kind);
        Ok(external_ids
            .iter()
            .filter_map(|ext| table.and_then(|t| t.get(ext)).map(|e| (*ext, e.id)))
            .collect())
    }

    async fn begin_batch(&mut self) -> Result<(), StoreUpsertError> {
        if self.batch.is_some() {
            return Err(StoreUpsertError::BatchState("batch already open"));
        }
        self.batch = Some(OpenBatch {
            next_id: self.state.next_id,
            undo: Vec::new(),
        });
        Ok(())
    }

    async fn upsert_entities(
        &mut self,
        kind: EntityKind,
        rows: &[EntityRow],
    ) -> Result<IdentifierMap, StoreUpsertError> {
        self.open_batch()?;
        if let Some(bad) = self.fail_on_external_id {
            if rows.iter().any(|r| r.external_id == bad) {
                return Err(StoreUpsertError::Rejected {
                    kind,
                    external_id: bad,
                    reason: "injected failure".into(),
                });
            }
        }
        let now = Utc::now();
        let mut ids = IdentifierMap::new();
        let mut undo = Vec::with_capacity(rows.len());
        for row in rows {
            let next_id = &mut self.state.next_id;
            let table = self.state.entities.entry(kind).or_default();
            undo.push(Undo::Entity {
                kind,
                external_id: row.external_id,
                prior: table.get(&row.external_id).cloned(),
            });
            let entity = table.entry(row.external_id).or_insert_with(|| {
                let id = *next_id;
                *next_id += 1;
                LocalEntity {
                    id,
                    external_id: row.external_id,
                    name: String::new(),
                    description: None,
                    release_date: None,
                    image_url: None,
                    parent_id: None,
                    last_updated_at: now,
                }
            });
            entity.name = row.name.clone();
            entity.description = row.description.clone();
            entity.release_date = row.release_date;
            entity.image_url = row.image_url.clone();
            entity.parent_id = row.parent_id;
            entity.last_updated_at = now;
            ids.insert(row.external_id, entity.id);
        }
        self.open_batch()?.undo.extend(undo);
        Ok(ids)
    }

    async fn existing_relationships(
        &mut self,
        relation: RelationKind,
        owner_ids: &[i64],
    ) -> Result<Vec<Pair>, StoreUpsertError> {
        let owners: HashSet<i64> = owner_ids.iter().copied().collect();
        Ok(self
            .state
            .relations
            .get(&relation)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter(|(owner, _)| owners.contains(owner))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply_relationship_changes(
        &mut self,
        relation: RelationKind,
        diff: &RelationDiff,
    ) -> Result<(), StoreUpsertError> {
        self.open_batch()?;
        let pairs = self.state.relations.entry(relation).or_default();
        let applied = apply_to_set(pairs, diff);
        let batch = self.open_batch()?;
        batch.undo.extend(
            applied
                .to_remove
                .into_iter()
                .map(|p| Undo::PairRemoved(relation, p)),
        );
        batch
            .undo
            .extend(applied.to_add.into_iter().map(|p| Undo::PairAdded(relation, p)));
        self.pair_deletes += diff.to_remove.len();
        self.insert_chunks += diff.to_add.chunks(RELATION_INSERT_CHUNK).count();
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<(), StoreUpsertError> {
        self.batch
            .take()
            .ok_or(StoreUpsertError::BatchState("commit without an open batch"))?;
        self.committed_batches += 1;
        Ok(())
    }

    async fn rollback_batch(&mut self) -> Result<(), StoreUpsertError> {
        let batch = self
            .batch
            .take()
            .ok_or(StoreUpsertError::BatchState("rollback without an open batch"))?;
        for entry in batch.undo.into_iter().rev() {
            match entry {
                Undo::Entity {
                    kind,
                    external_id,
                    prior,
                } => {
                    let table = self.state.entities.entry(kind).or_default();
                    match prior {
                        Some(entity) => table.insert(external_id, entity),
                        None => table.remove(&external_id),
                    };
                }
                Undo::PairAdded(relation, pair) => {
                    self.state.relations.entry(relation).or_default().remove(&pair);
                }
                Undo::PairRemoved(relation, pair) => {
                    self.state.relations.entry(relation).or_default().insert(pair);
                }
            }
        }
        self.state.next_id = batch.next_id;
        self.rolled_back_batches += 1;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), StoreUpsertError> {
        if self.batch.is_some() {
            return Err(StoreUpsertError::BatchState("reset while a batch is open"));
        }
        self.resets += 1;
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> Result<ImportCheckpoint, StoreUpsertError> {
        Ok(self.state.checkpoint)
    }

    async fn save_checkpoint(
        &mut self,
        checkpoint: &ImportCheckpoint,
    ) -> Result<(), StoreUpsertError> {
        self.state.checkpoint = *checkpoint;
        Ok(())
    }
}
