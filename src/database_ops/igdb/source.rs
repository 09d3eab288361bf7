use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RemoteFetchError;
use super::kinds::EntityKind;
use super::record::ExternalRecord;

/// IGDB rejects `limit` values above this.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Counted and paginated access to the remote metadata API.
///
/// Implementations do not retry; the import loop owns the retry policy.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn count(
        &self,
        kind: EntityKind,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<u64, RemoteFetchError>;

    /// One page of at most `limit` records, ordered stably by external id.
    async fn fetch_page(
        &self,
        kind: EntityKind,
        limit: u32,
        offset: u64,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>, RemoteFetchError>;
}
