use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use stc_extract::{extract_entities, scan_sync_headers, ExtractOptions};
use stc_storage::{PeriodRecord, SyncCheckpoint, TimeLogStore};
use stc_sync::{drop_child_tasks, explode_time_entries, plan_sync};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stc")]
#[command(about = "Study Time Cockpit CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a full export and start tracking a course period
    Init {
        /// SuperProductivity JSON export (or sync blob) to read
        #[arg(long)]
        source: PathBuf,
        /// SQLite database holding the local time log
        #[arg(long, default_value = "stc.db")]
        db: PathBuf,
        #[arg(long)]
        course: String,
        #[arg(long)]
        period: String,
        /// Period start date, DD-MM-YYYY
        #[arg(long)]
        start: String,
    },
    /// Pull changes made since the last recorded sync
    Sync {
        #[arg(long, default_value = "stc.db")]
        db: PathBuf,
        /// Override the source path recorded in the checkpoint
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Show the sync checkpoint and recent daily totals
    Status {
        #[arg(long, default_value = "stc.db")]
        db: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init {
            source,
            db,
            course,
            period,
            start,
        } => run_init(&source, &db, &course, &period, &start),
        Commands::Sync { db, source } => run_sync(&db, source.as_deref()),
        Commands::Status { db } => run_status(&db),
    }
}

fn run_init(source: &Path, db: &Path, course: &str, period: &str, start: &str) -> Result<()> {
    let start_date = NaiveDate::parse_from_str(start, "%d-%m-%Y")
        .with_context(|| format!("invalid period start {start:?}, expected DD-MM-YYYY"))?;
    let _lock = acquire_sync_lock(db)?;
    let mut store = TimeLogStore::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;

    let options = ExtractOptions::default();
    let headers = scan_sync_headers(open_source(source)?, &options)
        .context("source is missing sync headers")?;
    info!(
        event = "headers_scanned",
        last_update = headers.last_update,
        archive_young = headers.archive_young,
        archive_old = headers.archive_old,
    );

    let batch = extract_entities(open_source(source)?, &options)
        .context("full extraction failed")?;
    debug!(event = "extract_report", report = ?batch.report);

    let tasks = drop_child_tasks(batch.tasks);
    let entries = explode_time_entries(&tasks, &batch.projects, course, period, None);
    let written = store
        .upsert_time_entries(&entries)
        .context("failed to store time entries")?;
    info!(event = "entries_stored", written, tasks = tasks.len());

    store.upsert_period(&PeriodRecord {
        course: course.to_string(),
        period: period.to_string(),
        start_date,
        finished: false,
    })?;
    store.upsert_checkpoint(&SyncCheckpoint {
        source_path: source.display().to_string(),
        headers,
        course: course.to_string(),
        period: period.to_string(),
        updated_at: Utc::now(),
    })?;

    info!(event = "init_done", course, period);
    Ok(())
}

fn run_sync(db: &Path, source_override: Option<&Path>) -> Result<()> {
    let _lock = acquire_sync_lock(db)?;
    let mut store = TimeLogStore::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;

    let Some(checkpoint) = store.checkpoint()? else {
        bail!("no sync checkpoint found, run `stc init` first");
    };
    let source = source_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&checkpoint.source_path));

    let options = ExtractOptions::default();
    let remote = scan_sync_headers(open_source(&source)?, &options)
        .context("source is missing sync headers")?;
    let plan = plan_sync(&remote, Some(&checkpoint.headers));
    debug!(event = "sync_plan", plan = ?plan);

    if !plan.update_needed {
        info!(event = "up_to_date", last_update = remote.last_update);
        return Ok(());
    }
    if plan.young_archive_changed {
        info!(
            event = "young_archive_changed",
            local = checkpoint.headers.archive_young,
            remote = remote.archive_young,
        );
    }
    if plan.old_archive_changed {
        info!(
            event = "old_archive_changed",
            local = checkpoint.headers.archive_old,
            remote = remote.archive_old,
        );
    }

    let mut extract_options = ExtractOptions::default();
    extract_options.cutoff = plan.cutoff_day;
    let batch = extract_entities(open_source(&source)?, &extract_options)
        .context("incremental extraction failed")?;
    if batch.report.tasks_dropped_malformed > 0 {
        warn!(
            event = "malformed_tasks_skipped",
            count = batch.report.tasks_dropped_malformed,
        );
    }

    let tasks = drop_child_tasks(batch.tasks);
    let entries = explode_time_entries(
        &tasks,
        &batch.projects,
        &checkpoint.course,
        &checkpoint.period,
        plan.cutoff_day,
    );
    let written = store
        .upsert_time_entries(&entries)
        .context("failed to store time entries")?;
    info!(
        event = "sync_done",
        written,
        tasks = tasks.len(),
        cutoff = %plan.cutoff_day.map(|day| day.to_string()).unwrap_or_else(|| "none".to_string()),
    );

    store.upsert_checkpoint(&SyncCheckpoint {
        source_path: source.display().to_string(),
        headers: remote,
        course: checkpoint.course,
        period: checkpoint.period,
        updated_at: Utc::now(),
    })?;

    Ok(())
}

fn run_status(db: &Path) -> Result<()> {
    let store = TimeLogStore::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;

    let Some(checkpoint) = store.checkpoint()? else {
        println!("No sync checkpoint yet; run `stc init`.");
        return Ok(());
    };

    println!("Course:        {} / {}", checkpoint.course, checkpoint.period);
    println!("Source:        {}", checkpoint.source_path);
    println!("Last update:   {}", checkpoint.headers.last_update);
    println!(
        "Archives:      young={} old={}",
        checkpoint.headers.archive_young, checkpoint.headers.archive_old
    );
    println!("Synced at:     {}", checkpoint.updated_at.to_rfc3339());
    println!("Entries:       {}", store.entry_count()?);

    let totals = store.daily_totals(&checkpoint.course, &checkpoint.period)?;
    let recent = totals.iter().rev().take(14).collect::<Vec<_>>();
    if !recent.is_empty() {
        println!("Recent days:");
        for total in recent.into_iter().rev() {
            println!("  {}  {:<24} {:>6.2} h", total.day, total.subject, total.hours);
        }
    }
    Ok(())
}

fn open_source(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("failed to open source {}", path.display()))
}

/// At most one sync cycle may run against a database at a time; an advisory
/// lock beside the database file serializes them across processes.
fn acquire_sync_lock(db: &Path) -> Result<File> {
    let lock_path = db.with_extension("lock");
    let file = File::create(&lock_path)
        .with_context(|| format!("failed to create lock file {}", lock_path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "another sync cycle is already running (lock file {})",
            lock_path.display()
        );
    }
    Ok(file)
}
