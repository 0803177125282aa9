//! ns-migrate: bulk one-way migration of adaptive-bitrate video renditions
//! from Akamai NetStorage to Amazon S3.
//!
//! The origin is walked with its resumable flat listing. Each newly seen
//! asset directory is expanded into its top renditions, which are streamed
//! to S3 by a bounded worker pool. Once every rendition of an asset has
//! landed, one manifest line is appended to the manifest log.

#![warn(clippy::all)]

mod cli;
mod config;
mod destination;
mod migrate;
mod origin;
pub mod retry;
mod shutdown;
mod state;
mod types;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, MigrateArgs};
use migrate::paths::Cursor;
use state::StateDb;

/// Print run history, checkpoint and dead letters from the state database.
async fn run_status(state_dir: &str, show_dead_letters: bool) -> anyhow::Result<()> {
    let state_dir = config::expand_tilde(state_dir);
    let db_path = state_dir.join("state.db");

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        let manifest_log = state_dir.join("manifests.jsonl");
        let manifests: Vec<state::ManifestRecord> = state::jsonl::read_all(&manifest_log).await?;
        if manifests.is_empty() {
            println!("Run a migration first to create the database.");
        } else {
            println!(
                "{} manifests recorded in {}",
                manifests.len(),
                manifest_log.display()
            );
        }
        return Ok(());
    }

    let db = state::SqliteStateDb::open(&db_path).await?;
    let summary = db.get_summary().await?;

    println!("State Database: {}", db_path.display());
    println!();
    println!("Runs:             {}", summary.runs);
    println!("Manifests:        {}", summary.manifests);
    println!("Dead letters:     {}", summary.task_dead_letters);
    println!("Failed assets:    {}", summary.failed_assets);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!(
            "Last run started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(checkpoint) = &summary.last_checkpoint {
        println!(
            "Last checkpoint:    {} (run {}, {} transferred)",
            checkpoint.cursor, checkpoint.run_id, checkpoint.transferred
        );
    }

    let runs = db.recent_runs(10).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in &runs {
            let status = match (&run.completed_at, run.stats.interrupted) {
                (None, _) => "running or crashed",
                (Some(_), true) => "interrupted",
                (Some(_), false) => "done",
            };
            println!(
                "  #{} from {} - {}: {} transferred, {} manifests, {} dead letters",
                run.id,
                run.start_cursor,
                status,
                run.stats.transferred,
                run.stats.manifests,
                run.stats.dead_letters
            );
            if let Some(cursor) = &run.stats.resume_cursor {
                println!("      resume with: ns-migrate resume {}", cursor);
            }
        }
    }

    if show_dead_letters {
        let dead_letters = db.get_dead_letters().await?;
        println!();
        println!("Dead letters:");
        if dead_letters.is_empty() {
            println!("  (none)");
        }
        for record in dead_letters {
            let subject = record
                .source
                .clone()
                .unwrap_or_else(|| record.paths.join(", "));
            println!(
                "  [{}] {} {} - {}",
                record.kind.as_str(),
                record.asset_id,
                subject,
                record.error
            );
        }
    }

    Ok(())
}

/// Run a migration starting at `start_at`.
async fn run_migration(
    state_dir: &str,
    args: MigrateArgs,
    start_at: impl FnOnce(&migrate::paths::PathLayout) -> Cursor,
) -> anyhow::Result<()> {
    let config = config::Config::from_args(state_dir, args)?;
    tracing::debug!(?config, "Configuration loaded");

    let signer = origin::RequestSigner::new(config.key_name.clone(), config.key.as_bytes())?;
    let origin: Arc<dyn origin::OriginStore> = Arc::new(origin::NetStorageClient::new(
        config.origin_scheme,
        &config.host,
        signer,
    )?);

    let migrate_config = config.migrate_config();
    let start = start_at(&migrate_config.layout);
    let shutdown_token = shutdown::install_signal_handler()?;

    if config.dry_run {
        let summary = migrate::dry_run(origin, &migrate_config, start, shutdown_token).await;
        if let Some(e) = summary.enumeration_error {
            anyhow::bail!("Listing failed during dry run: {}", e);
        }
        return Ok(());
    }

    tracing::info!(
        concurrency = config.jobs,
        bucket = %config.bucket,
        "Starting ns-migrate"
    );

    let destination = Arc::new(
        destination::S3ObjectStore::connect(destination::S3Settings {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        })
        .await,
    );

    let db_path = config.db_path();
    let state_db: Option<Arc<dyn StateDb>> = match state::SqliteStateDb::open(&db_path).await {
        Ok(db) => {
            tracing::debug!("State database opened at {}", db_path.display());
            Some(Arc::new(db) as Arc<dyn StateDb>)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to open state database at {}: {}. Continuing without run history.",
                db_path.display(),
                e
            );
            None
        }
    };

    let ledger = Arc::new(
        state::Ledger::open(
            &config.manifest_log,
            &config.dead_letter_log,
            state_db,
            start.as_str(),
        )
        .await?,
    );
    tracing::info!("Manifest log: {}", config.manifest_log.display());
    if let Some(run_id) = ledger.run_id() {
        tracing::debug!(run_id, "Recording run in state database");
    }

    let summary = migrate::run(
        origin,
        destination,
        ledger,
        &migrate_config,
        start,
        shutdown_token,
    )
    .await;

    if summary.is_complete() {
        return Ok(());
    }

    let resume_hint = summary
        .resume
        .as_ref()
        .map(|c| format!("; resume with `ns-migrate resume {}`", c))
        .unwrap_or_default();
    if summary.interrupted {
        anyhow::bail!("Migration interrupted{}", resume_hint);
    }
    if let Some(e) = &summary.enumeration_error {
        anyhow::bail!("Listing failed: {}{}", e, resume_hint);
    }
    let c = summary.counters;
    anyhow::bail!(
        "{} transfers dead-lettered, {} assets failed, {} records not written (see {})",
        c.dead_lettered,
        c.failed_assets,
        summary.ledger_failures,
        config.dead_letter_log.display()
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = config::load_env_file()?;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();
    if env_file_loaded {
        tracing::debug!("Loaded environment file");
    }

    match cli.command {
        Command::Status { dead_letters } => run_status(&cli.state_dir, dead_letters).await,
        Command::Start { subdirectory, args } => {
            run_migration(&cli.state_dir, args, |layout| {
                layout.start_cursor(subdirectory.as_deref())
            })
            .await
        }
        Command::Resume { cursor, args } => {
            run_migration(&cli.state_dir, args, |_| Cursor::new(cursor)).await
        }
    }
}
