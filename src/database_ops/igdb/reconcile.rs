use indexmap::IndexSet;
use std::collections::HashMap;

use super::error::StoreUpsertError;
use super::kinds::EntityKind;
use super::record::ExternalRecord;
use super::store::UpsertStore;

/// External id -> internal id, valid for one batch only.
pub type IdentifierMap = HashMap<i64, i64>;

/// Identifier maps for a batch: its own kind plus every kind it references.
#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    pub kind: EntityKind,
    pub own: IdentifierMap,
    pub references: HashMap<EntityKind, IdentifierMap>,
}

impl ResolvedBatch {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            own: IdentifierMap::new(),
            references: HashMap::new(),
        }
    }

    pub fn references(&self, kind: EntityKind) -> Option<&IdentifierMap> {
        self.references.get(&kind)
    }
}

fn distinct<I: IntoIterator<Item = i64>>(ids: I) -> Vec<i64> {
    ids.into_iter().collect::<IndexSet<i64>>().into_iter().collect()
}

/// Resolves the batch's ids with one bulk lookup per kind; kinds with nothing
/// to look up are skipped. Read-only.
pub async fn resolve<S>(
    kind: EntityKind,
    batch: &[ExternalRecord],
    store: &mut S,
) -> Result<ResolvedBatch, StoreUpsertError>
where
    S: UpsertStore + ?Sized,
{
    let mut resolved = ResolvedBatch::new(kind);

    let own_ids = distinct(batch.iter().map(|r| r.id));
    if !own_ids.is_empty() {
        resolved.own = store.lookup_ids(kind, &own_ids).await?;
    }

    for referenced in kind.referenced_kinds() {
        let ids = distinct(
            batch
                .iter()
                .flat_map(|r| kind.referenced_external_ids(referenced, r)),
        );
        let map = if ids.is_empty() {
            IdentifierMap::new()
        } else {
            store.lookup_ids(referenced, &ids).await?
        };
        resolved.references.insert(referenced, map);
    }
    Ok(resolved)
}
