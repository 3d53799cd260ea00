//! `sailsync sync`, `sailsync runs`, and `sailsync run <id>`.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sailsync_core::models::{RunSummary, SyncError, SyncRun, SyncTrigger};
use sailsync_core::store::RunStore;

use crate::config::Config;
use crate::coverage::{format_ts_iso, format_ts_relative};
use crate::feed::open_feed;
use crate::ingest::{dry_run, DryRunReport, RunError, SyncRunner};
use crate::progress::{format_number, ProgressMode};
use crate::sqlite_store::SqliteStore;

/// Runs one sync to completion and prints the summary. Ctrl-C cancels
/// cooperatively: files in flight finish, the rest are left unstarted.
pub async fn run_sync(config: &Config, dry: bool, progress: ProgressMode) -> Result<()> {
    let reporter = progress.reporter();

    if dry {
        let feed = open_feed(config, None)?;
        let report = dry_run(feed, config.sync.workers, reporter).await?;
        print_dry_run(&report);
        return Ok(());
    }

    let store = Arc::new(SqliteStore::open(config).await?);
    let runner = SyncRunner::from_config(Arc::clone(&store), config, SyncTrigger::Cli, None);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling sync");
            on_interrupt.cancel();
        }
    });

    let result = runner.run(cancel, reporter).await;
    interrupt.abort();

    let run = match result {
        Ok(run) => run,
        Err(RunError::Fatal { run_id, message }) => {
            if let Some(run) = store.get_run(&run_id).await? {
                print_run(&run);
            }
            store.pool().close().await;
            bail!("sync failed: {message}");
        }
        Err(e) => {
            store.pool().close().await;
            return Err(e.into());
        }
    };

    print_run(&run);
    println!("ok");
    store.pool().close().await;
    Ok(())
}

pub async fn run_list(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let runs = store.list_runs(limit, config.sync.error_preview).await?;
    store.pool().close().await;

    if runs.is_empty() {
        println!("No sync runs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10} {:<16} {:>9} {:>8} {:>8} {:>6}",
        "RUN", "STATUS", "STARTED", "PROCESSED", "SKIPPED", "SAILINGS", "STUBS"
    );
    println!("{}", "-".repeat(102));
    for summary in &runs {
        print_summary_row(summary);
    }
    Ok(())
}

fn print_summary_row(summary: &RunSummary) {
    let run = &summary.run;
    println!(
        "{:<36}  {:<10} {:<16} {:>9} {:>8} {:>8} {:>6}",
        run.id,
        run.status.as_str(),
        format_ts_relative(run.started_at),
        format_number(run.metrics.files_processed),
        format_number(run.metrics.files_skipped),
        format_number(run.metrics.sailings_upserted),
        format_number(run.metrics.stubs_created),
    );
    for err in &summary.run.errors {
        println!("    {}", error_line(err));
    }
    if summary.errors_truncated {
        println!(
            "    ... {} more error(s); see `sailsync run {}`",
            summary.error_count - summary.run.errors.len() as u64,
            run.id
        );
    }
}

pub async fn run_show(config: &Config, run_id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let run = store.get_run(run_id).await?;
    store.pool().close().await;

    match run {
        Some(run) => {
            print_run(&run);
            Ok(())
        }
        None => bail!("No sync run with id '{run_id}'"),
    }
}

fn error_line(err: &SyncError) -> String {
    match &err.external_id {
        Some(id) => format!("[{}] {} ({}): {}", err.error_type, err.file_path, id, err.message),
        None => format!("[{}] {}: {}", err.error_type, err.file_path, err.message),
    }
}

fn print_run(run: &SyncRun) {
    println!("sync run {}", run.id);
    println!("  feed:      {}", run.feed_label);
    println!("  trigger:   {}", run.trigger.as_str());
    println!("  status:    {}", run.status);
    println!("  started:   {}", format_ts_iso(run.started_at));
    if let Some(done) = run.completed_at {
        println!("  completed: {}", format_ts_iso(done));
    }
    println!("  files processed:   {}", format_number(run.metrics.files_processed));
    println!("  files skipped:     {}", format_number(run.metrics.files_skipped));
    println!("  sailings upserted: {}", format_number(run.metrics.sailings_upserted));
    println!("  stubs created:     {}", format_number(run.metrics.stubs_created));
    if let Some(fatal) = &run.fatal_error {
        println!("  fatal error: {fatal}");
    }
    if !run.errors.is_empty() {
        println!("  errors:");
        for err in &run.errors {
            println!("    {}", error_line(err));
        }
    }
}

fn print_dry_run(report: &DryRunReport) {
    println!("sync {} (dry-run)", report.feed);
    println!("  files found: {}", format_number(report.files));
    println!("  valid: {}", format_number(report.valid));
    println!("  repairs applied: {}", format_number(report.repairs));
    println!("  rejected: {}", format_number(report.rejected.len() as u64));
    for err in &report.rejected {
        println!("    {}", error_line(err));
    }
}
