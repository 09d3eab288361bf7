//! Desired-state computation and set differencing for game relationships.
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::kinds::RelationKind;
use super::reconcile::ResolvedBatch;
use super::record::ExternalRecord;

/// `(owner internal id, target internal id)`.
pub type Pair = (i64, i64);

/// Desired target ids per touched owner. An owner with an empty set still
/// counts as touched: all of its stored pairs are stale.
pub type DesiredRelations = IndexMap<i64, IndexSet<i64>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationDiff {
    pub to_add: Vec<Pair>,
    pub to_remove: Vec<Pair>,
}

impl RelationDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Builds the desired pairs for `relation` from a batch whose own ids and
/// target ids have been resolved. Targets unknown to the store are skipped.
pub fn desired_relations(
    relation: RelationKind,
    batch: &[ExternalRecord],
    resolved: &ResolvedBatch,
) -> DesiredRelations {
    let targets = resolved.references(relation.target_kind());
    let mut desired: DesiredRelations = IndexMap::new();
    let mut unresolved = 0usize;
    for record in batch {
        let Some(&owner) = resolved.own.get(&record.id) else {
            continue;
        };
        // Later duplicates of the same record win, matching the entity upsert.
        let set = desired.entry(owner).or_default();
        set.clear();
        for external in relation.target_external_ids(record) {
            match targets.and_then(|m| m.get(external)) {
                Some(&target) => {
                    set.insert(target);
                }
                None => unresolved += 1,
            }
        }
    }
    if unresolved > 0 {
        debug!(
            target = "igdb",
            relation = %relation,
            unresolved,
            "skipped relationship targets missing from the store"
        );
    }
    desired
}

/// Pure set difference per owner, unioned across the batch. Existing pairs for
/// owners outside `desired` are ignored.
pub fn diff_relationships(desired: &DesiredRelations, existing: &[Pair]) -> RelationDiff {
    let mut existing_by_owner: HashMap<i64, IndexSet<i64>> = HashMap::new();
    for &(owner, target) in existing {
        existing_by_owner.entry(owner).or_default().insert(target);
    }
    let empty = IndexSet::new();
    let mut diff = RelationDiff::default();
    for (&owner, wanted) in desired {
        let current = existing_by_owner.get(&owner).unwrap_or(&empty);
        diff.to_remove.extend(
            current
                .iter()
                .filter(|t| !wanted.contains(*t))
                .map(|&t| (owner, t)),
        );
        diff.to_add.extend(
            wanted
                .iter()
                .filter(|t| !current.contains(*t))
                .map(|&t| (owner, t)),
        );
    }
    diff
}

/// Applies a diff to an in-memory pair set; used by stores without SQL.
/// Applies `diff` to an in-memory pair set and returns the pairs that actually changed.
pub fn apply_to_set(pairs: &mut HashSet<Pair>, diff: &RelationDiff) -> RelationDiff {
    let mut applied = RelationDiff::default();
    for pair in &diff.to_remove {
        if pairs.remove(pair) {
            applied.to_remove.push(*pair);
        }
    }
    for pair in &diff.to_add {
        if pairs.insert(*pair) {
            applied.to_add.push(*pair);
        }
    }
    applied
}
