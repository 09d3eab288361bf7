use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use itertools::Itertools;
use patchnote_sync::database_ops::db::Db;
use patchnote_sync::database_ops::patch_notes::{
    compute_diff, parse, presentation_cleanup, ModificationStore,
};
use patchnote_sync::util::env as env_util;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "patch_notes", version, about = "Patch-note parsing, diffing and edit history")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a patch note into title and change entries (`-` reads stdin)
    Parse { input: PathBuf },
    /// Diff two revisions and print the change record
    Diff(DiffArgs),
    /// Diff two revisions and store the result as a modification
    Record(RecordArgs),
    /// List stored modifications of a patch note
    History {
        patch_note_id: i64,
        #[arg(long = "include-deleted", action = ArgAction::SetTrue)]
        include_deleted: bool,
    },
    /// Soft-delete a stored modification
    Delete { id: i64 },
}

#[derive(Debug, Args)]
struct DiffArgs {
    old: PathBuf,
    new: PathBuf,
    /// Apply presentation cleanup before printing
    #[arg(long, action = ArgAction::SetTrue)]
    cleanup: bool,
}

#[derive(Debug, Args)]
struct RecordArgs {
    patch_note_id: i64,
    user_id: i64,
    old: PathBuf,
    new: PathBuf,
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

async fn open_store() -> Result<ModificationStore> {
    let database_url = env_util::db_url().context("no database URL configured")?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 2);
    let db = Db::connect_no_migrate(&database_url, max_conns).await?;
    Ok(ModificationStore::new(db))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("patch_notes");
    patchnote_sync::telemetry::init_tracing("warn")?;

    match Cli::parse().command {
        Command::Parse { input } => {
            let parsed = parse(&read_input(&input)?);
            info!(
                target = "patch_notes",
                changes = parsed.changes.len(),
                types = %parsed.changes.iter().map(|c| format!("{:?}", c.change_type)).unique().join(","),
                "parsed"
            );
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Command::Diff(args) => {
            let record = compute_diff(&read_input(&args.old)?, &read_input(&args.new)?);
            let record = if args.cleanup {
                presentation_cleanup(&record)
            } else {
                record
            };
            println!("{}", serde_json::to_string(&record)?);
        }
        Command::Record(args) => {
            let old = read_input(&args.old)?;
            let new = read_input(&args.new)?;
            let store = open_store().await?;
            match store
                .record_edit(args.patch_note_id, args.user_id, &old, &new)
                .await?
            {
                Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
                None => warn!(target = "patch_notes", "revisions are identical; nothing recorded"),
            }
        }
        Command::History {
            patch_note_id,
            include_deleted,
        } => {
            let store = open_store().await?;
            let rows = store
                .list_for_patch_note(patch_note_id, include_deleted)
                .await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Delete { id } => {
            let store = open_store().await?;
            if !store.soft_delete(id).await? {
                anyhow::bail!("no live modification with id {id}");
            }
            println!("deleted {id}");
        }
    }
    Ok(())
}
