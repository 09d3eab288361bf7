use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use patchnote_sync::database_ops::db::Db;
use patchnote_sync::database_ops::igdb::{
    EntityKind, IgdbClient, ImportCheckpoint, ImportError, MemoryStore, PgStore, UpsertStore,
};
use patchnote_sync::orchestrator::{
    parse_concurrency, parse_fetch_size, BatchOrchestrator, ImportOptions, OrchestratorConfig,
    RunReport, RunScope,
};
use patchnote_sync::util::env as env_util;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "igdb_import", version, about = "Import genres, companies, games and extensions from IGDB")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import genres
    Genres(ImportArgs),
    /// Import companies
    Companies(ImportArgs),
    /// Import games with their genre and company links
    Games(ImportArgs),
    /// Import extensions (DLC) of known games
    Extensions(ImportArgs),
    /// Import every kind in dependency order and advance the checkpoint
    All(ImportArgs),
}

#[derive(Debug, Clone, Args)]
struct ImportArgs {
    /// Only records updated after this unix timestamp (overrides the checkpoint)
    #[arg(long)]
    from: Option<i64>,
    /// Start offset of the first kind imported
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    offset: i64,
    /// Records per page, 1..=500
    #[arg(long = "fetch-size", alias = "fetchSize", allow_negative_numbers = true)]
    fetch_size: Option<i64>,
    /// Page windows per iteration, 1..=4
    #[arg(long, allow_negative_numbers = true)]
    concurrency: Option<i64>,
    /// Ignore the checkpoint and import everything
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
    /// Kinds to leave out (comma-separated)
    #[arg(long, value_enum, value_delimiter = ',')]
    skip: Vec<EntityKind>,
    /// Write to an in-memory store instead of Postgres
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Apply pending migrations before importing
    #[arg(long, action = ArgAction::SetTrue)]
    migrate: bool,
}

impl Command {
    fn split(self) -> (RunScope, ImportArgs) {
        match self {
            Command::Genres(a) => (RunScope::Single(EntityKind::Genre), a),
            Command::Companies(a) => (RunScope::Single(EntityKind::Company), a),
            Command::Games(a) => (RunScope::Single(EntityKind::Game), a),
            Command::Extensions(a) => (RunScope::Single(EntityKind::Extension), a),
            Command::All(a) => (RunScope::All, a),
        }
    }
}

fn build_config(args: &ImportArgs) -> Result<OrchestratorConfig, ImportError> {
    let mut cfg = OrchestratorConfig::from_env();
    if let Some(raw) = args.fetch_size {
        cfg.fetch_size = parse_fetch_size(raw)?;
    }
    if let Some(raw) = args.concurrency {
        cfg.concurrency = parse_concurrency(raw)?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn log_report(report: &RunReport) {
    for k in &report.kinds {
        info!(
            target = "igdb",
            kind = ?k.kind,
            total = k.total,
            fetched = k.fetched,
            created = k.created,
            relations_added = k.relations_added,
            relations_removed = k.relations_removed,
            iterations = k.iterations,
            memory_resets = k.memory_resets,
            "kind summary"
        );
    }
}

async fn run_with_store(
    store: &mut dyn UpsertStore,
    source: &IgdbClient,
    cfg: OrchestratorConfig,
    scope: RunScope,
    options: &ImportOptions,
) -> Result<RunReport, ImportError> {
    let checkpoint = if options.force {
        ImportCheckpoint::default()
    } else {
        store.load_checkpoint().await?
    };
    info!(target = "igdb", checkpoint = ?checkpoint.last_imported_at, ?scope, "starting import");

    let report = BatchOrchestrator::new(source, &mut *store, cfg)
        .run(scope, options, checkpoint)
        .await?;
    if let Some(next) = &report.checkpoint {
        store.save_checkpoint(next).await?;
        info!(target = "igdb", at = ?next.last_imported_at, "checkpoint saved");
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("igdb_import");
    patchnote_sync::telemetry::init_tracing("info")?;

    let cli = Cli::parse();
    let (scope, args) = cli.command.split();
    let options = ImportOptions {
        from: args.from,
        offset: args.offset,
        force: args.force,
        skip: args.skip.clone(),
    };

    // Option errors are reported before any remote call.
    let cfg = build_config(&args)?;
    patchnote_sync::orchestrator::validate_options(&options, &cfg)?;

    env_util::preflight_check(
        "igdb_import",
        &["TWITCH_CLIENT_ID"],
        &[
            "TWITCH_CLIENT_ID",
            "TWITCH_CLIENT_SECRET",
            "IGDB_ACCESS_TOKEN",
            "IGDB_FETCH_SIZE",
            "IGDB_CONCURRENCY",
            "DATABASE_URL",
        ],
    )?;
    let source = IgdbClient::new_from_env().context("failed to build IGDB client")?;

    let result = if args.dry_run {
        warn!(target = "igdb", "dry run: writing to an in-memory store");
        let mut store = MemoryStore::new();
        run_with_store(&mut store, &source, cfg, scope, &options).await
    } else {
        let database_url = env_util::db_url().context("no database URL configured")?;
        let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 4);
        let db = if args.migrate {
            Db::connect(&database_url, max_conns).await?
        } else {
            Db::connect_no_migrate(&database_url, max_conns).await?
        };
        let mut store = PgStore::new(db);
        run_with_store(&mut store, &source, cfg, scope, &options).await
    };

    match result {
        Ok(report) => {
            log_report(&report);
            Ok(())
        }
        Err(err) => {
            if let ImportError::Store(inner) = &err {
                error!(target = "igdb", error = ?inner, "store failure; batch rolled back");
            } else {
                error!(target = "igdb", error = %err, "import failed");
            }
            Err(err.into())
        }
    }
}
