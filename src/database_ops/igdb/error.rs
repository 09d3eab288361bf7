use thiserror::Error;

use super::kinds::EntityKind;
use super::source::MAX_PAGE_SIZE;

/// Which remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Count,
    Page,
}

impl std::fmt::Display for FetchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStage::Count => f.write_str("count"),
            FetchStage::Page => f.write_str("page fetch"),
        }
    }
}

/// Transport, HTTP or payload failure from the remote source.
#[derive(Debug, Clone, Error)]
#[error("igdb {stage} for {kind} at offset {offset} failed: {message}")]
pub struct RemoteFetchError {
    pub kind: EntityKind,
    pub stage: FetchStage,
    pub offset: u64,
    /// Rate limiting (429), server errors and transport failures.
    pub retryable: bool,
    pub message: String,
}

impl RemoteFetchError {
    pub fn new(kind: EntityKind, stage: FetchStage, offset: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            offset,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Failure while upserting entities or mutating relationship rows.
#[derive(Debug, Error)]
pub enum StoreUpsertError {
    #[error("store query failed during {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid store batch state: {0}")]
    BatchState(&'static str),
    #[error("store rejected {kind} record {external_id}: {reason}")]
    Rejected {
        kind: EntityKind,
        external_id: i64,
        reason: String,
    },
    #[error("store reconnect failed: {0}")]
    Reconnect(String),
}

impl StoreUpsertError {
    pub fn database(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| StoreUpsertError::Database { context, source }
    }
}

/// Invalid command options, reported before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("--offset must be zero or positive (got {0})")]
    NegativeOffset(i64),
    #[error("--fetch-size must be between 1 and {max} (got {got})", max = MAX_PAGE_SIZE)]
    FetchSize { got: i64 },
    #[error("--concurrency must be between 1 and {max} (got {got})")]
    Concurrency { got: i64, max: u32 },
    #[error("--from is not a valid unix timestamp ({0})")]
    Timestamp(i64),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Remote(#[from] RemoteFetchError),
    #[error(transparent)]
    Store(#[from] StoreUpsertError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_names_kind_and_offset() {
        let err = RemoteFetchError::new(EntityKind::Game, FetchStage::Page, 1000, "status 500");
        assert_eq!(
            err.to_string(),
            "igdb page fetch for games at offset 1000 failed: status 500"
        );
        assert!(!err.retryable);
        assert!(err.retryable().retryable);
    }

    #[test]
    fn validation_messages_are_one_line() {
        let msg = ValidationError::FetchSize { got: 900 }.to_string();
        assert_eq!(msg, "--fetch-size must be between 1 and 500 (got 900)");
    }
}
