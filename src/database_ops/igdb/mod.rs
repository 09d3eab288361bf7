// IGDB import pipeline: remote paging, id reconciliation, batched upserts
// and relationship diffing against the local Postgres schema.

pub mod checkpoint;
pub mod client;
pub mod error;
pub mod kinds;
pub mod memory_store;
pub mod pg_store;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod relations;
pub mod source;
pub mod store;

pub use checkpoint::ImportCheckpoint;
pub use client::IgdbClient;
pub use error::{ImportError, RemoteFetchError, StoreUpsertError, ValidationError};
pub use kinds::EntityKind;
pub use memory_store::MemoryStore;
pub use pg_store::PgStore;
pub use source::RemoteSource;
pub use store::UpsertStore;
