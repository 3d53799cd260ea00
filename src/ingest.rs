//! Sync run orchestration.
//!
//! One run walks the whole feed: each file goes through
//! fetch → parse → validate → resolve → upsert, on a bounded worker pool.
//!
//! | From | To | When |
//! |------|----|------|
//! | — | `running` | [`SyncRunner::begin`] claims the single running slot |
//! | `running` | `completed` | every listed file was attempted |
//! | `running` | `cancelled` | cancellation left at least one file unstarted |
//! | `running` | `failed` | a run-fatal error (feed listing, credentials, bookkeeping) |
//!
//! Record-level problems never end a run: the file is skipped and a
//! [`SyncError`] is appended. Cancellation is checked before a file starts;
//! files already in flight finish normally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use sailsync_core::error::{summarize, RecordError};
use sailsync_core::feed::{normalize_external_id, parse_record, validate};
use sailsync_core::models::{SyncError, SyncRun, SyncStatus, SyncTrigger};
use sailsync_core::resolve::resolve_refs;
use sailsync_core::store::{CatalogStore, RunStore};
use sailsync_core::upsert::upsert;

use crate::config::{Config, FeedKind};
use crate::credentials::CredentialSource;
use crate::feed::{open_feed, FeedError, FeedSource};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

pub const ABANDONED_MESSAGE: &str =
    "abandoned: run was still running past sync.stale_after_minutes";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    /// The run was finalized `failed` with `message` stored verbatim.
    #[error("sync run {run_id} failed: {message}")]
    Fatal { run_id: String, message: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub trigger: SyncTrigger,
    pub workers: usize,
    pub stale_after_minutes: i64,
}

impl RunOptions {
    pub fn from_config(config: &Config, trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            workers: config.sync.workers,
            stale_after_minutes: config.sync.stale_after_minutes,
        }
    }
}

/// Label recorded on a run, known before the feed is opened.
pub fn feed_label(config: &Config) -> String {
    match config.feed.kind {
        FeedKind::Directory => format!(
            "directory:{}",
            config
                .feed
                .root
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
        FeedKind::Http => format!(
            "http:{}",
            config
                .feed
                .base_url
                .as_deref()
                .unwrap_or_default()
                .trim_end_matches('/')
        ),
    }
}

type FeedOpener = Arc<dyn Fn() -> Result<Arc<dyn FeedSource>, FeedError> + Send + Sync>;

/// Drives sync runs against one store and one feed.
pub struct SyncRunner<S: ?Sized> {
    store: Arc<S>,
    label: String,
    open: FeedOpener,
    options: RunOptions,
}

impl<S: ?Sized> Clone for SyncRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            label: self.label.clone(),
            open: Arc::clone(&self.open),
            options: self.options,
        }
    }
}

/// How one file ended.
enum FileOutcome {
    Upserted { stubs_created: u64 },
    Skipped(SyncError),
    Fatal(String),
}

fn file_error(path: &str, err: &RecordError, external_id: Option<String>) -> SyncError {
    SyncError {
        file_path: path.to_string(),
        error_type: err.error_type(),
        message: err.detail().to_string(),
        external_id,
        created_at: Utc::now().timestamp(),
    }
}

fn feed_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

async fn process_file<S>(store: &S, feed: &dyn FeedSource, path: &str) -> FileOutcome
where
    S: CatalogStore + ?Sized,
{
    let bytes = match feed.fetch(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_fatal() => return FileOutcome::Fatal(e.to_string()),
        Err(e) => {
            let err = RecordError::Fetch(e.to_string());
            return FileOutcome::Skipped(file_error(path, &err, None));
        }
    };

    let raw = match parse_record(&bytes) {
        Ok(raw) => raw,
        Err(e) => {
            let err = RecordError::Parse(e.to_string());
            return FileOutcome::Skipped(file_error(path, &err, None));
        }
    };

    let (record, repairs) = match validate(&raw) {
        Ok(validated) => validated,
        Err(errors) => {
            let err = RecordError::Validation(summarize(&errors));
            return FileOutcome::Skipped(file_error(
                path,
                &err,
                normalize_external_id(&raw.voyage_id),
            ));
        }
    };
    for repair in &repairs {
        debug!(file = path, external_id = %record.external_id, %repair, "repaired field");
    }

    let refs = match resolve_refs(store, &record).await {
        Ok(refs) => refs,
        Err(e) => {
            return FileOutcome::Skipped(file_error(
                path,
                &e,
                Some(record.external_id.clone()),
            ))
        }
    };

    match upsert(store, &record, &refs, Some(&feed_hash(&bytes))).await {
        Ok(_) => FileOutcome::Upserted {
            stubs_created: refs.stubs_created,
        },
        Err(e) => FileOutcome::Skipped(file_error(path, &e, Some(record.external_id))),
    }
}

impl<S> SyncRunner<S>
where
    S: CatalogStore + RunStore + ?Sized + 'static,
{
    /// A runner for the configured feed. Credentials are read when a run
    /// executes, not here.
    pub fn from_config(
        store: Arc<S>,
        config: &Config,
        trigger: SyncTrigger,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        let feed_config = config.clone();
        let open: FeedOpener = Arc::new(move || open_feed(&feed_config, credentials.as_deref()));
        Self {
            store,
            label: feed_label(config),
            open,
            options: RunOptions::from_config(config, trigger),
        }
    }

    /// A runner over an already-built feed.
    pub fn with_feed(store: Arc<S>, feed: Arc<dyn FeedSource>, options: RunOptions) -> Self {
        let label = feed.label();
        let open: FeedOpener = Arc::new(move || Ok(Arc::clone(&feed)));
        Self {
            store,
            label,
            open,
            options,
        }
    }

    /// Fails abandoned runs, then claims the single running slot.
    #[instrument(skip_all, fields(feed = %self.label))]
    pub async fn begin(&self) -> Result<SyncRun, RunError> {
        let now = Utc::now().timestamp();
        let cutoff = now - self.options.stale_after_minutes * 60;
        for run_id in self
            .store
            .fail_stale_runs(cutoff, now, ABANDONED_MESSAGE)
            .await?
        {
            warn!(%run_id, "marked abandoned sync run failed");
        }

        let run = SyncRun::start(self.options.trigger, &self.label, now);
        if !self.store.start_run(&run).await? {
            return Err(RunError::AlreadyRunning);
        }
        info!(run_id = %run.id, trigger = run.trigger.as_str(), "sync run started");
        Ok(run)
    }

    /// Begins a run and processes it to the end.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> Result<SyncRun, RunError> {
        let run = self.begin().await?;
        self.execute(&run.id, cancel, progress).await
    }

    async fn fail(&self, run_id: &str, message: String) -> Result<SyncRun, RunError> {
        error!(%run_id, %message, "sync run failed");
        self.store
            .finish_run(run_id, SyncStatus::Failed, Utc::now().timestamp(), Some(&message))
            .await?;
        Err(RunError::Fatal {
            run_id: run_id.to_string(),
            message,
        })
    }

    /// Processes every feed file for a run started by [`begin`](Self::begin)
    /// and finalizes it. Returns the finished run with its errors.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn execute(
        &self,
        run_id: &str,
        cancel: CancellationToken,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> Result<SyncRun, RunError> {
        let feed = match (self.open)() {
            Ok(feed) => feed,
            Err(e) => return self.fail(run_id, e.to_string()).await,
        };

        progress.report(SyncProgressEvent::Listing {
            feed: self.label.clone(),
        });
        let files = match feed.list_files().await {
            Ok(files) => files,
            Err(e) => return self.fail(run_id, e.to_string()).await,
        };
        let total = files.len() as u64;
        info!(%run_id, files = total, "feed listed");

        // Fires on external cancellation or a run-fatal error.
        let stop = cancel.child_token();
        let unstarted = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicU64::new(0));
        let fatal: Arc<tokio::sync::Mutex<Option<String>>> = Arc::new(tokio::sync::Mutex::new(None));

        stream::iter(files)
            .map(|path| {
                let store = Arc::clone(&self.store);
                let feed = Arc::clone(&feed);
                let progress = Arc::clone(&progress);
                let stop = stop.clone();
                let unstarted = Arc::clone(&unstarted);
                let finished = Arc::clone(&finished);
                let fatal = Arc::clone(&fatal);
                let run_id = run_id.to_string();
                let label = self.label.clone();

                async move {
                    if stop.is_cancelled() {
                        unstarted.store(true, Ordering::SeqCst);
                        return;
                    }

                    let bookkeeping = match process_file(&*store, &*feed, &path).await {
                        FileOutcome::Upserted { stubs_created } => {
                            store.record_success(&run_id, 1, stubs_created).await
                        }
                        FileOutcome::Skipped(err) => {
                            warn!(
                                file = %path,
                                error_type = err.error_type.as_str(),
                                message = %err.message,
                                "skipped feed file"
                            );
                            store.record_failure(&run_id, &err).await
                        }
                        FileOutcome::Fatal(message) => {
                            fatal.lock().await.get_or_insert(message);
                            stop.cancel();
                            return;
                        }
                    };
                    if let Err(e) = bookkeeping {
                        fatal
                            .lock()
                            .await
                            .get_or_insert(format!("failed to record progress: {e:#}"));
                        stop.cancel();
                        return;
                    }

                    let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.report(SyncProgressEvent::Processing { feed: label, n, total });
                }
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect::<Vec<()>>()
            .await;

        let fatal_message = fatal.lock().await.take();
        if let Some(message) = fatal_message {
            return self.fail(run_id, message).await;
        }

        let status = if unstarted.load(Ordering::SeqCst) {
            SyncStatus::Cancelled
        } else {
            SyncStatus::Completed
        };
        self.store
            .finish_run(run_id, status, Utc::now().timestamp(), None)
            .await?;

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("sync run {run_id} disappeared"))?;
        info!(
            %run_id,
            status = %run.status,
            processed = run.metrics.files_processed,
            skipped = run.metrics.files_skipped,
            stubs = run.metrics.stubs_created,
            "sync run finished"
        );
        Ok(run)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dry run
// ═══════════════════════════════════════════════════════════════════════

/// Validation-only pass over a feed. Nothing is written.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DryRunReport {
    pub feed: String,
    pub files: u64,
    pub valid: u64,
    pub repairs: u64,
    pub rejected: Vec<SyncError>,
}

enum Checked {
    Valid { repairs: u64 },
    Rejected(SyncError),
}

fn check_bytes(path: &str, bytes: &[u8]) -> Checked {
    let raw = match parse_record(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            let err = RecordError::Parse(e.to_string());
            return Checked::Rejected(file_error(path, &err, None));
        }
    };
    match validate(&raw) {
        Ok((_, repairs)) => Checked::Valid {
            repairs: repairs.len() as u64,
        },
        Err(errors) => Checked::Rejected(file_error(
            path,
            &RecordError::Validation(summarize(&errors)),
            normalize_external_id(&raw.voyage_id),
        )),
    }
}

/// Fetches, parses, and validates every file without touching a store.
pub async fn dry_run(
    feed: Arc<dyn FeedSource>,
    workers: usize,
    progress: Arc<dyn SyncProgressReporter>,
) -> Result<DryRunReport, FeedError> {
    let label = feed.label();
    progress.report(SyncProgressEvent::Listing {
        feed: label.clone(),
    });
    let files = feed.list_files().await?;
    let total = files.len() as u64;
    let finished = Arc::new(AtomicU64::new(0));

    let results: Vec<Result<Checked, FeedError>> = stream::iter(files)
        .map(|path| {
            let feed = Arc::clone(&feed);
            let progress = Arc::clone(&progress);
            let finished = Arc::clone(&finished);
            let label = label.clone();
            async move {
                let checked = match feed.fetch(&path).await {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        let err = RecordError::Fetch(e.to_string());
                        Checked::Rejected(file_error(&path, &err, None))
                    }
                    Ok(bytes) => check_bytes(&path, &bytes),
                };
                let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
                progress.report(SyncProgressEvent::Processing { feed: label, n, total });
                Ok(checked)
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut report = DryRunReport {
        feed: label,
        files: total,
        ..DryRunReport::default()
    };
    for result in results {
        match result? {
            Checked::Valid { repairs } => {
                report.valid += 1;
                report.repairs += repairs;
            }
            Checked::Rejected(err) => report.rejected.push(err),
        }
    }
    report.rejected.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════════
// Active runs
// ═══════════════════════════════════════════════════════════════════════

/// Cancellation tokens for runs executing in this process.
#[derive(Default)]
pub struct ActiveRuns {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveRuns {
    pub fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_string(), token.clone());
        token
    }

    pub fn remove(&self, run_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }

    /// Requests cancellation. False when the run is not executing here.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
