//! IGDB import loop: count, page, fetch, reconcile, upsert and relate per
//! entity kind, with an umbrella run over all kinds in dependency order.
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::database_ops::igdb::checkpoint::ImportCheckpoint;
use crate::database_ops::igdb::error::{ImportError, RemoteFetchError, StoreUpsertError, ValidationError};
use crate::database_ops::igdb::kinds::EntityKind;
use crate::database_ops::igdb::reconcile::resolve;
use crate::database_ops::igdb::record::ExternalRecord;
use crate::database_ops::igdb::relations::{desired_relations, diff_relationships};
use crate::database_ops::igdb::source::{RemoteSource, MAX_PAGE_SIZE};
use crate::database_ops::igdb::store::{upsert_batch, UpsertStore};
use crate::util::env::env_parse;
use crate::util::memory::resident_set_bytes;

pub const MAX_CONCURRENCY: u32 = 4;
pub const DEFAULT_FETCH_SIZE: u32 = 500;

/// Retries for remote errors flagged retryable, waiting `backoff * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fetch_size: u32,
    /// Page windows fetched per outer iteration.
    pub concurrency: u32,
    /// Pause between consecutive remote calls.
    pub call_pause: Duration,
    /// Minimum wall-clock time of one outer iteration.
    pub min_iteration: Duration,
    pub memory_high_water_bytes: u64,
    pub retry: RetryPolicy,
    pub memory_probe: fn() -> Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            concurrency: MAX_CONCURRENCY,
            call_pause: Duration::from_millis(50),
            min_iteration: Duration::from_secs(1),
            memory_high_water_bytes: 900 * 1024 * 1024,
            retry: RetryPolicy::default(),
            memory_probe: resident_set_bytes,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `IGDB_*` variables; CLI flags are applied on top.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fetch_size: env_parse("IGDB_FETCH_SIZE", d.fetch_size),
            concurrency: env_parse("IGDB_CONCURRENCY", d.concurrency),
            call_pause: Duration::from_millis(env_parse("IGDB_CALL_PAUSE_MS", 50u64)),
            min_iteration: Duration::from_millis(env_parse("IGDB_MIN_ITERATION_MS", 1000u64)),
            memory_high_water_bytes: env_parse("IGDB_MEMORY_HIGH_WATER_MB", 900u64) * 1024 * 1024,
            retry: RetryPolicy {
                max_retries: env_parse("IGDB_MAX_RETRIES", d.retry.max_retries),
                backoff: Duration::from_millis(env_parse("IGDB_BACKOFF_MS", 1000u64)),
            },
            memory_probe: d.memory_probe,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        parse_fetch_size(i64::from(self.fetch_size))?;
        parse_concurrency(i64::from(self.concurrency))?;
        Ok(())
    }
}

pub fn parse_fetch_size(raw: i64) -> Result<u32, ValidationError> {
    match u32::try_from(raw) {
        Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => Ok(n),
        _ => Err(ValidationError::FetchSize { got: raw }),
    }
}

pub fn parse_concurrency(raw: i64) -> Result<u32, ValidationError> {
    match u32::try_from(raw) {
        Ok(n) if (1..=MAX_CONCURRENCY).contains(&n) => Ok(n),
        _ => Err(ValidationError::Concurrency {
            got: raw,
            max: MAX_CONCURRENCY,
        }),
    }
}

/// Per-run options from the command line.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Unix timestamp overriding the checkpoint.
    pub from: Option<i64>,
    /// Start offset of the first kind run.
    pub offset: i64,
    /// Full run: ignore the checkpoint and `from`.
    pub force: bool,
    pub skip: Vec<EntityKind>,
}

impl ImportOptions {
    pub fn start_offset(&self) -> Result<u64, ValidationError> {
        u64::try_from(self.offset).map_err(|_| ValidationError::NegativeOffset(self.offset))
    }

    pub fn from_time(&self) -> Result<Option<DateTime<Utc>>, ValidationError> {
        self.from
            .map(|ts| DateTime::from_timestamp(ts, 0).ok_or(ValidationError::Timestamp(ts)))
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScope {
    Single(EntityKind),
    All,
}

impl RunScope {
    fn kinds(self) -> Vec<EntityKind> {
        match self {
            RunScope::Single(kind) => vec![kind],
            RunScope::All => EntityKind::RUN_ORDER.to_vec(),
        }
    }
}

/// Checks every option before any remote call is made.
pub fn validate_options(
    options: &ImportOptions,
    config: &OrchestratorConfig,
) -> Result<(), ValidationError> {
    options.start_offset()?;
    options.from_time()?;
    config.validate()
}

/// Offsets of the page windows of one outer iteration; windows at or past
/// `total` are dropped.
pub fn page_windows(offset: u64, total: u64, fetch_size: u32, concurrency: u32) -> Vec<u64> {
    (0..u64::from(concurrency))
        .map(|i| offset + i * u64::from(fetch_size))
        .take_while(|o| *o < total)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindReport {
    pub kind: Option<EntityKind>,
    pub updated_since: Option<DateTime<Utc>>,
    pub total: u64,
    pub fetched: u64,
    pub created: u64,
    pub relations_added: u64,
    pub relations_removed: u64,
    pub iterations: u32,
    pub memory_resets: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub kinds: Vec<KindReport>,
    /// New checkpoint; set only when an all-kinds run completed.
    pub checkpoint: Option<ImportCheckpoint>,
}

impl RunReport {
    pub fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.iter().find(|r| r.kind == Some(kind))
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    created: u64,
    added: u64,
    removed: u64,
}

async fn retry_remote<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RemoteFetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteFetchError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable && attempt < policy.max_retries => {
                attempt += 1;
                let wait = policy.backoff * attempt;
                warn!(target = "igdb", error = %e, attempt, wait_ms = wait.as_millis() as u64, "retrying remote call");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

pub struct BatchOrchestrator<'a> {
    source: &'a dyn RemoteSource,
    store: &'a mut dyn UpsertStore,
    config: OrchestratorConfig,
    /// Records of the current outer iteration; released on memory relief.
    buffer: Vec<ExternalRecord>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        source: &'a dyn RemoteSource,
        store: &'a mut dyn UpsertStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
            buffer: Vec::new(),
        }
    }

    /// Runs `scope` and returns per-kind reports. The returned checkpoint is
    /// only set for a completed all-kinds run with nothing skipped; persisting it
    /// is up to the caller.
    #[instrument(skip(self, options, checkpoint))]
    pub async fn run(
        &mut self,
        scope: RunScope,
        options: &ImportOptions,
        checkpoint: ImportCheckpoint,
    ) -> Result<RunReport, ImportError> {
        validate_options(options, &self.config)?;
        let mut start_offset = options.start_offset()?;
        let from = options.from_time()?;
        if options.force && from.is_some() {
            warn!(target = "igdb", "--force set; ignoring --from");
        }
        let since = if options.force {
            None
        } else {
            from.or(checkpoint.last_imported_at)
        };

        let mut report = RunReport::default();
        for kind in scope.kinds() {
            if options.skip.contains(&kind) {
                info!(target = "igdb", kind = %kind, "skipped");
                continue;
            }
            let kind_since = match scope {
                RunScope::Single(_) => since,
                RunScope::All if kind.spec().incremental_in_umbrella => since,
                RunScope::All => None,
            };
            let kind_report = self.import_kind(kind, kind_since, start_offset).await?;
            report.kinds.push(kind_report);
            start_offset = 0;
        }

        if scope == RunScope::All && options.skip.is_empty() {
            let next = ImportCheckpoint::at(Utc::now());
            info!(target = "igdb", at = ?next.last_imported_at, "all kinds imported");
            report.checkpoint = Some(next);
        } else if scope == RunScope::All {
            warn!(target = "igdb", skipped = ?options.skip, "kinds skipped; checkpoint left unchanged");
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn import_kind(
        &mut self,
        kind: EntityKind,
        updated_since: Option<DateTime<Utc>>,
        start_offset: u64,
    ) -> Result<KindReport, ImportError> {
        let source = self.source;
        let total =
            retry_remote(self.config.retry, || source.count(kind, updated_since)).await?;
        info!(target = "igdb", kind = %kind, total, since = ?updated_since, start_offset, "import starting");

        let mut report = KindReport {
            kind: Some(kind),
            updated_since,
            total,
            ..KindReport::default()
        };
        let fetch_size = self.config.fetch_size;
        let step = u64::from(fetch_size) * u64::from(self.config.concurrency);
        let mut offset = start_offset;

        while offset < total {
            let started = Instant::now();
            let windows = page_windows(offset, total, fetch_size, self.config.concurrency);

            self.buffer.clear();
            for (i, window) in windows.iter().enumerate() {
                if i > 0 {
                    pause(self.config.call_pause).await;
                }
                let page = retry_remote(self.config.retry, || {
                    source.fetch_page(kind, fetch_size, *window, updated_since)
                })
                .await?;
                debug!(target = "igdb", kind = %kind, offset = *window, n = page.len(), "page fetched");
                self.buffer.extend(page);
            }
            if self.buffer.is_empty() {
                warn!(target = "igdb", kind = %kind, offset, total, "remote returned no records before count was reached");
                break;
            }

            let batch = std::mem::take(&mut self.buffer);
            let result = self.process_batch(kind, &batch).await;
            let fetched = batch.len() as u64;
            self.buffer = batch;
            let outcome = result?;

            report.iterations += 1;
            report.fetched += fetched;
            report.created += outcome.created;
            report.relations_added += outcome.added;
            report.relations_removed += outcome.removed;
            offset += step;
            info!(
                target = "igdb",
                kind = %kind,
                offset,
                fetched,
                processed = report.fetched,
                total,
                created = outcome.created,
                added = outcome.added,
                removed = outcome.removed,
                "batch imported"
            );

            if self.relieve_memory().await? {
                report.memory_resets += 1;
            }
            let elapsed = started.elapsed();
            if elapsed < self.config.min_iteration {
                pause(self.config.min_iteration - elapsed).await;
            }
        }
        self.buffer.clear();
        info!(
            target = "igdb",
            kind = %kind,
            fetched = report.fetched,
            created = report.created,
            iterations = report.iterations,
            "import finished"
        );
        Ok(report)
    }

    /// One store transaction per batch; any failure rolls the batch back.
    async fn process_batch(
        &mut self,
        kind: EntityKind,
        batch: &[ExternalRecord],
    ) -> Result<BatchOutcome, StoreUpsertError> {
        self.store.begin_batch().await?;
        match self.write_batch(kind, batch).await {
            Ok(outcome) => {
                self.store.commit_batch().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rb) = self.store.rollback_batch().await {
                    error!(target = "igdb", kind = %kind, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_batch(
        &mut self,
        kind: EntityKind,
        batch: &[ExternalRecord],
    ) -> Result<BatchOutcome, StoreUpsertError> {
        let mut resolved = resolve(kind, batch, &mut *self.store).await?;
        let created = upsert_batch(&mut *self.store, kind, batch, &mut resolved).await?;
        let mut outcome = BatchOutcome {
            created: created.len() as u64,
            ..BatchOutcome::default()
        };

        for relation in kind.spec().relations {
            let desired = desired_relations(*relation, batch, &resolved);
            if desired.is_empty() {
                continue;
            }
            let owners: Vec<i64> = desired.keys().copied().collect();
            let existing = self.store.existing_relationships(*relation, &owners).await?;
            let diff = diff_relationships(&desired, &existing);
            if diff.is_empty() {
                continue;
            }
            self.store.apply_relationship_changes(*relation, &diff).await?;
            outcome.added += diff.to_add.len() as u64;
            outcome.removed += diff.to_remove.len() as u64;
        }
        Ok(outcome)
    }

    /// Resets the store and drops buffered records when resident memory is
    /// above the high-water mark. Runs only between batches.
    async fn relieve_memory(&mut self) -> Result<bool, StoreUpsertError> {
        let Some(rss) = (self.config.memory_probe)() else {
            return Ok(false);
        };
        if rss <= self.config.memory_high_water_bytes {
            return Ok(false);
        }
        warn!(
            target = "igdb",
            rss_mb = rss / (1024 * 1024),
            limit_mb = self.config.memory_high_water_bytes / (1024 * 1024),
            "memory above high-water mark; resetting store"
        );
        self.store.reset().await?;
        self.buffer = Vec::new();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::igdb::error::FetchStage;
    use crate::database_ops::igdb::kinds::RelationKind;
    use crate::database_ops::igdb::memory_store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Count(EntityKind, Option<DateTime<Utc>>),
        Page(EntityKind, u64),
    }

    struct PageFailure {
        kind: EntityKind,
        offset: u64,
        retryable: bool,
        remaining: u32,
    }

    #[derive(Default)]
    struct ScriptedSource {
        records: HashMap<EntityKind, Vec<ExternalRecord>>,
        calls: Mutex<Vec<Call>>,
        failure: Mutex<Option<PageFailure>>,
    }

    impl ScriptedSource {
        fn with(mut self, kind: EntityKind, records: Vec<ExternalRecord>) -> Self {
            self.records.insert(kind, records);
            self
        }

        fn fail_page(self, kind: EntityKind, offset: u64, retryable: bool, times: u32) -> Self {
            *self.failure.lock().unwrap() = Some(PageFailure {
                kind,
                offset,
                retryable,
                remaining: times,
            });
            self
        }

        fn matching(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Vec<ExternalRecord> {
            self.records
                .get(&kind)
                .map(|all| {
                    all.iter()
                        .filter(|r| match since {
                            Some(t) => r.updated_at.unwrap_or(0) > t.timestamp(),
                            None => true,
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn page_offsets(&self, kind: EntityKind) -> Vec<u64> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Page(k, o) if k == kind => Some(o),
                    _ => None,
                })
                .collect()
        }

        fn counted(&self) -> Vec<(EntityKind, Option<DateTime<Utc>>)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Count(k, s) => Some((k, s)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn count(
            &self,
            kind: EntityKind,
            updated_since: Option<DateTime<Utc>>,
        ) -> Result<u64, RemoteFetchError> {
            self.calls.lock().unwrap().push(Call::Count(kind, updated_since));
            Ok(self.matching(kind, updated_since).len() as u64)
        }

        async fn fetch_page(
            &self,
            kind: EntityKind,
            limit: u32,
            offset: u64,
            updated_since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ExternalRecord>, RemoteFetchError> {
            self.calls.lock().unwrap().push(Call::Page(kind, offset));
            if let Some(f) = self.failure.lock().unwrap().as_mut() {
                if f.kind == kind && f.offset == offset && f.remaining > 0 {
                    f.remaining -= 1;
                    let err = RemoteFetchError::new(kind, FetchStage::Page, offset, "status 503");
                    return Err(if f.retryable { err.retryable() } else { err });
                }
            }
            Ok(self
                .matching(kind, updated_since)
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }
    }

    fn quiet_memory() -> Option<u64> {
        Some(100 * 1024 * 1024)
    }

    fn high_memory() -> Option<u64> {
        Some(2 * 1024 * 1024 * 1024)
    }

    fn config(fetch_size: u32, concurrency: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_size,
            concurrency,
            call_pause: Duration::ZERO,
            min_iteration: Duration::ZERO,
            retry: RetryPolicy {
                max_retries: 0,
                backoff: Duration::ZERO,
            },
            memory_probe: quiet_memory,
            ..OrchestratorConfig::default()
        }
    }

    fn named(id: i64) -> ExternalRecord {
        ExternalRecord {
            id,
            name: Some(format!("Record {id}")),
            updated_at: Some(1_600_000_000),
            ..Default::default()
        }
    }

    fn game(id: i64, genres: &[i64], companies: &[i64]) -> ExternalRecord {
        ExternalRecord {
            genres: genres.to_vec(),
            companies: companies.to_vec(),
            ..named(id)
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn windows_cover_the_count_without_overlap() {
        assert_eq!(page_windows(0, 1200, 500, 4), vec![0, 500, 1000]);
        assert_eq!(page_windows(2000, 2100, 500, 4), vec![2000]);
        assert!(page_windows(1200, 1200, 500, 4).is_empty());

        let (count, size, conc) = (1234u64, 100u32, 3u32);
        let mut covered = Vec::new();
        let mut offset = 0;
        while offset < count {
            for w in page_windows(offset, count, size, conc) {
                covered.extend(w..(w + u64::from(size)).min(count));
            }
            offset += u64::from(size * conc);
        }
        assert_eq!(covered, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn options_are_validated_before_running() {
        let cfg = config(500, 4);
        let bad_offset = ImportOptions {
            offset: -1,
            ..Default::default()
        };
        assert_eq!(
            validate_options(&bad_offset, &cfg),
            Err(ValidationError::NegativeOffset(-1))
        );
        assert_eq!(parse_fetch_size(0), Err(ValidationError::FetchSize { got: 0 }));
        assert_eq!(parse_fetch_size(501), Err(ValidationError::FetchSize { got: 501 }));
        assert_eq!(parse_fetch_size(500), Ok(500));
        assert!(parse_concurrency(5).is_err());
        assert!(validate_options(&ImportOptions::default(), &config(600, 1)).is_err());
    }

    #[tokio::test]
    async fn invalid_options_make_no_remote_calls() {
        let source = ScriptedSource::default().with(EntityKind::Genre, vec![named(1)]);
        let mut store = MemoryStore::new();
        let mut orch = BatchOrchestrator::new(&source, &mut store, config(500, 4));
        let options = ImportOptions {
            offset: -5,
            ..Default::default()
        };
        let err = orch
            .run(RunScope::All, &options, ImportCheckpoint::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Validation(_)));
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn twelve_hundred_games_take_three_cycles_at_concurrency_one() {
        let games: Vec<ExternalRecord> = (1..=1200).map(|i| game(i, &[], &[])).collect();
        let source = ScriptedSource::default().with(EntityKind::Game, games);
        let mut store = MemoryStore::new();
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 1))
            .run(RunScope::Single(EntityKind::Game), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();

        assert_eq!(source.page_offsets(EntityKind::Game), vec![0, 500, 1000]);
        let games = report.kind(EntityKind::Game).unwrap();
        assert_eq!(games.iterations, 3);
        assert_eq!(games.fetched, 1200);
        assert_eq!(games.created, 1200);
        assert_eq!(games.memory_resets, 0);
        assert_eq!(store.committed_batches(), 3);
        assert_eq!(store.entity_count(EntityKind::Game), 1200);
        assert_eq!(store.resets(), 0);
        // Bulk lookup: one call per batch for the own kind.
        assert_eq!(store.lookup_calls(EntityKind::Game), 3);
        assert!(report.checkpoint.is_none());
    }

    #[tokio::test]
    async fn concurrency_four_fetches_all_windows_in_one_iteration() {
        let games: Vec<ExternalRecord> = (1..=1200).map(|i| game(i, &[], &[])).collect();
        let source = ScriptedSource::default().with(EntityKind::Game, games);
        let mut store = MemoryStore::new();
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::Single(EntityKind::Game), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(source.page_offsets(EntityKind::Game), vec![0, 500, 1000]);
        assert_eq!(report.kind(EntityKind::Game).unwrap().iterations, 1);
        assert_eq!(store.committed_batches(), 1);
    }

    #[tokio::test]
    async fn start_offset_skips_the_leading_records() {
        let genres: Vec<ExternalRecord> = (1..=10).map(named).collect();
        let source = ScriptedSource::default().with(EntityKind::Genre, genres);
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            offset: 4,
            ..Default::default()
        };
        BatchOrchestrator::new(&source, &mut store, config(3, 1))
            .run(RunScope::Single(EntityKind::Genre), &options, ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(source.page_offsets(EntityKind::Genre), vec![4, 7]);
        assert_eq!(store.entity_count(EntityKind::Genre), 6);
    }

    fn catalogue() -> ScriptedSource {
        ScriptedSource::default()
            .with(EntityKind::Genre, vec![named(7), named(8)])
            .with(EntityKind::Company, vec![named(70)])
            .with(
                EntityKind::Game,
                vec![game(42, &[7, 8], &[70]), game(43, &[8], &[])],
            )
            .with(
                EntityKind::Extension,
                vec![ExternalRecord {
                    parent_game: Some(42),
                    ..named(500)
                }],
            )
    }

    #[tokio::test]
    async fn umbrella_runs_kinds_in_order_and_honours_skip() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            skip: vec![EntityKind::Company],
            ..Default::default()
        };
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &options, ImportCheckpoint::default())
            .await
            .unwrap();

        let order: Vec<EntityKind> = source.counted().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            order,
            vec![EntityKind::Genre, EntityKind::Game, EntityKind::Extension]
        );
        assert_eq!(store.entity_count(EntityKind::Company), 0);
        // Companies were skipped, so only genre pairs exist.
        assert!(store.relation_pairs(RelationKind::GameCompany).is_empty());
        assert_eq!(store.relation_pairs(RelationKind::GameGenre).len(), 3);
        assert!(report.checkpoint.is_none());
    }

    #[tokio::test]
    async fn skipping_games_keeps_the_previous_checkpoint() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            skip: vec![EntityKind::Game],
            ..Default::default()
        };
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &options, ImportCheckpoint::at(ts(1_500_000_000)))
            .await
            .unwrap();
        assert!(report.kind(EntityKind::Game).is_none());
        assert!(report.checkpoint.is_none());

        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert!(report.checkpoint.is_some());
    }

    #[tokio::test]
    async fn umbrella_offset_applies_to_the_first_kind_only() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            offset: 1,
            ..Default::default()
        };
        BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &options, ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(source.page_offsets(EntityKind::Genre), vec![1]);
        assert_eq!(source.page_offsets(EntityKind::Company), vec![0]);
        assert_eq!(source.page_offsets(EntityKind::Game), vec![0]);
        assert_eq!(source.page_offsets(EntityKind::Extension), vec![0]);
        assert_eq!(store.entity_count(EntityKind::Genre), 1);
        assert_eq!(store.entity_count(EntityKind::Game), 2);
    }

    #[tokio::test]
    async fn extensions_point_at_their_parent_game() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        let parent = store.entity(EntityKind::Game, 42).unwrap().id;
        assert_eq!(
            store.entity(EntityKind::Extension, 500).unwrap().parent_id,
            Some(parent)
        );
    }

    #[tokio::test]
    async fn umbrella_passes_checkpoint_to_games_only() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let since = ts(1_500_000_000);
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::at(since))
            .await
            .unwrap();
        assert_eq!(
            source.counted(),
            vec![
                (EntityKind::Genre, None),
                (EntityKind::Company, None),
                (EntityKind::Game, Some(since)),
                (EntityKind::Extension, None),
            ]
        );
        assert!(report.checkpoint.unwrap().last_imported_at.unwrap() > since);
    }

    #[tokio::test]
    async fn force_ignores_checkpoint_and_from() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            force: true,
            from: Some(1_400_000_000),
            ..Default::default()
        };
        BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::Single(EntityKind::Game), &options, ImportCheckpoint::at(ts(1_500_000_000)))
            .await
            .unwrap();
        assert_eq!(source.counted(), vec![(EntityKind::Game, None)]);
    }

    #[tokio::test]
    async fn single_kind_uses_from_over_checkpoint() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        let options = ImportOptions {
            from: Some(1_700_000_000),
            ..Default::default()
        };
        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::Single(EntityKind::Genre), &options, ImportCheckpoint::at(ts(1_500_000_000)))
            .await
            .unwrap();
        assert_eq!(source.counted(), vec![(EntityKind::Genre, Some(ts(1_700_000_000)))]);
        // Every record is older than `from`.
        assert_eq!(report.kind(EntityKind::Genre).unwrap().total, 0);
        assert!(source.page_offsets(EntityKind::Genre).is_empty());
    }

    #[tokio::test]
    async fn importing_twice_is_idempotent() {
        let source = catalogue();
        let mut store = MemoryStore::new();
        BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        let snapshot = |s: &MemoryStore| {
            let ids: Vec<(i64, i64, String)> = EntityKind::RUN_ORDER
                .iter()
                .flat_map(|k| s.entities(*k))
                .map(|e| (e.id, e.external_id, e.name.clone()))
                .collect();
            (
                ids,
                s.relation_pairs(RelationKind::GameGenre),
                s.relation_pairs(RelationKind::GameCompany),
            )
        };
        let first = snapshot(&store);

        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(snapshot(&store), first);
        assert!(report.kinds.iter().all(|k| k.created == 0));
        assert!(report
            .kinds
            .iter()
            .all(|k| k.relations_added == 0 && k.relations_removed == 0));
    }

    #[tokio::test]
    async fn stale_genre_pair_is_replaced() {
        let source = ScriptedSource::default().with(EntityKind::Game, vec![game(42, &[7], &[])]);
        let mut store = MemoryStore::new();
        store.seed(EntityKind::Genre, 7, 3);
        store.seed(EntityKind::Genre, 9, 9);
        store.seed(EntityKind::Game, 42, 100);
        store.seed_relation(RelationKind::GameGenre, (100, 9));
        store.seed_relation(RelationKind::GameGenre, (200, 9));

        let report = BatchOrchestrator::new(&source, &mut store, config(500, 4))
            .run(RunScope::Single(EntityKind::Game), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(
            store.relation_pairs(RelationKind::GameGenre),
            BTreeSet::from([(100, 3), (200, 9)])
        );
        assert_eq!(store.pair_deletes(), 1);
        let games = report.kind(EntityKind::Game).unwrap();
        assert_eq!((games.relations_added, games.relations_removed), (1, 1));
        assert_eq!(games.created, 0);
    }

    #[tokio::test]
    async fn fatal_fetch_error_stops_the_run_and_keeps_prior_batches() {
        let genres: Vec<ExternalRecord> = (1..=10).map(named).collect();
        let source = ScriptedSource::default()
            .with(EntityKind::Genre, genres)
            .fail_page(EntityKind::Genre, 5, false, 1);
        let mut store = MemoryStore::new();
        let err = BatchOrchestrator::new(&source, &mut store, config(5, 1))
            .run(RunScope::All, &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap_err();
        match err {
            ImportError::Remote(e) => {
                assert_eq!((e.kind, e.offset), (EntityKind::Genre, 5));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.committed_batches(), 1);
        assert_eq!(store.entity_count(EntityKind::Genre), 5);
        // No later kind was started.
        assert_eq!(source.counted().len(), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_when_policy_allows() {
        let genres: Vec<ExternalRecord> = (1..=3).map(named).collect();
        let source = ScriptedSource::default()
            .with(EntityKind::Genre, genres.clone())
            .fail_page(EntityKind::Genre, 0, true, 2);
        let mut store = MemoryStore::new();
        let mut cfg = config(500, 1);
        cfg.retry.max_retries = 2;
        BatchOrchestrator::new(&source, &mut store, cfg)
            .run(RunScope::Single(EntityKind::Genre), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(source.page_offsets(EntityKind::Genre), vec![0, 0, 0]);
        assert_eq!(store.entity_count(EntityKind::Genre), 3);

        // Default policy: fatal on the first error.
        let source = ScriptedSource::default()
            .with(EntityKind::Genre, genres)
            .fail_page(EntityKind::Genre, 0, true, 1);
        let mut store = MemoryStore::new();
        let result = BatchOrchestrator::new(&source, &mut store, config(500, 1))
            .run(RunScope::Single(EntityKind::Genre), &ImportOptions::default(), ImportCheckpoint::default())
            .await;
        assert!(matches!(result, Err(ImportError::Remote(_))));
    }

    #[tokio::test]
    async fn store_failure_rolls_back_the_whole_batch() {
        let games = vec![game(1, &[7], &[]), game(2, &[7], &[]), game(3, &[7], &[])];
        let source = ScriptedSource::default().with(EntityKind::Game, games);
        let mut store = MemoryStore::new();
        store.seed(EntityKind::Genre, 7, 3);
        store.fail_on(3);
        let err = BatchOrchestrator::new(&source, &mut store, config(500, 1))
            .run(RunScope::Single(EntityKind::Game), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Store(StoreUpsertError::Rejected { external_id: 3, .. })
        ));
        assert_eq!(store.rolled_back_batches(), 1);
        assert_eq!(store.entity_count(EntityKind::Game), 0);
        assert!(store.relation_pairs(RelationKind::GameGenre).is_empty());
    }

    #[tokio::test]
    async fn memory_above_high_water_resets_store_each_iteration() {
        let genres: Vec<ExternalRecord> = (1..=9).map(named).collect();
        let source = ScriptedSource::default().with(EntityKind::Genre, genres);
        let mut store = MemoryStore::new();
        let mut cfg = config(3, 1);
        cfg.memory_probe = high_memory;
        let report = BatchOrchestrator::new(&source, &mut store, cfg)
            .run(RunScope::Single(EntityKind::Genre), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(report.kind(EntityKind::Genre).unwrap().memory_resets, 3);
        assert_eq!(store.resets(), 3);
        assert_eq!(store.entity_count(EntityKind::Genre), 9);
    }

    #[tokio::test]
    async fn iterations_are_padded_to_the_minimum_duration() {
        let genres: Vec<ExternalRecord> = (1..=4).map(named).collect();
        let source = ScriptedSource::default().with(EntityKind::Genre, genres);
        let mut store = MemoryStore::new();
        let mut cfg = config(2, 1);
        cfg.min_iteration = Duration::from_millis(30);
        let started = Instant::now();
        BatchOrchestrator::new(&source, &mut store, cfg)
            .run(RunScope::Single(EntityKind::Genre), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn page_fetches_within_an_iteration_are_spaced_by_the_call_pause() {
        let genres: Vec<ExternalRecord> = (1..=6).map(named).collect();
        let source = ScriptedSource::default().with(EntityKind::Genre, genres);
        let mut store = MemoryStore::new();
        let mut cfg = config(2, 3);
        cfg.call_pause = Duration::from_millis(20);
        let started = Instant::now();
        let report = BatchOrchestrator::new(&source, &mut store, cfg)
            .run(RunScope::Single(EntityKind::Genre), &ImportOptions::default(), ImportCheckpoint::default())
            .await
            .unwrap();
        // Three windows, two pauses, none before the first call.
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(source.page_offsets(EntityKind::Genre), vec![0, 2, 4]);
        assert_eq!(report.kind(EntityKind::Genre).unwrap().iterations, 1);
    }
}
