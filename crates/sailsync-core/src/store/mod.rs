//! Storage abstraction for SailSync.
//!
//! [`CatalogStore`] covers canonical entities and sailings; [`RunStore`]
//! covers sync run bookkeeping. Both are needed by the pipeline, and search
//! reads from both (results plus the `sync_in_progress` flag).
//!
//! Implementations must be `Send + Sync` and must make each operation
//! atomic on its own: entity resolution is insert-on-conflict, a sailing
//! upsert rewrites the row and its child rows together, and at most one run
//! may be `running` at a time.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::coverage::CoverageStats;
use crate::models::{
    CanonicalEntity, EntityAttrs, EntityKind, RunSummary, Sailing, SyncError, SyncRun, SyncStatus,
};
use crate::search::{SailingPage, SearchQuery};
use crate::upsert::SailingUpsert;

/// Outcome of resolving one entity reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub entity: CanonicalEntity,
    /// True when this call inserted the row as a new stub.
    pub created: bool,
}

/// Canonical catalog and sailing storage.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`resolve_entity`](CatalogStore::resolve_entity) | Find or create by `(kind, external_id)`, merging attributes |
/// | [`get_entity`](CatalogStore::get_entity) | Fetch one entity by provider key |
/// | [`entity_names`](CatalogStore::entity_names) | Display names for a set of internal ids |
/// | [`confirm_entity`](CatalogStore::confirm_entity) | Operator review: clear the stub flags |
/// | [`upsert_sailing`](CatalogStore::upsert_sailing) | Insert or update a sailing with its child rows |
/// | [`get_sailing`](CatalogStore::get_sailing) | Fetch one sailing by internal or external id |
/// | [`query_sailings`](CatalogStore::query_sailings) | Filtered, sorted, paginated search |
/// | [`coverage`](CatalogStore::coverage) | Catalog completeness aggregates |
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Looks up `(kind, external_id)`, creating a stub when unseen.
    ///
    /// Non-empty attributes in `attrs` overwrite stored values; empty ones
    /// never erase. `is_stub` and `needs_review` are never cleared here.
    async fn resolve_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        attrs: &EntityAttrs,
        now: i64,
    ) -> Result<Resolution>;

    async fn get_entity(&self, kind: EntityKind, external_id: &str)
        -> Result<Option<CanonicalEntity>>;

    /// Maps internal ids to names. Ids without a name are absent.
    async fn entity_names(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Clears `is_stub` and `needs_review`. Returns `None` for unknown keys.
    async fn confirm_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        now: i64,
    ) -> Result<Option<CanonicalEntity>>;

    /// Inserts or updates by `external_id`, replacing itinerary stops,
    /// region links, and cabin grades in the same transaction.
    ///
    /// On conflict only feed-owned columns change; `id`, `created_at`, and
    /// `notes` are preserved.
    async fn upsert_sailing(&self, sailing: &SailingUpsert) -> Result<Sailing>;

    async fn get_sailing(&self, id: &str) -> Result<Option<Sailing>>;

    async fn query_sailings(&self, query: &SearchQuery) -> Result<SailingPage>;

    async fn coverage(&self, oldest_limit: usize, now: i64) -> Result<CoverageStats>;
}

/// Sync run bookkeeping.
///
/// Run rows are mutated only while `running`; every method that mutates a
/// terminal run returns an error instead.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a new `running` run. Returns `false` if another run is
    /// already `running`.
    async fn start_run(&self, run: &SyncRun) -> Result<bool>;

    /// Counts one successfully processed file.
    async fn record_success(&self, run_id: &str, sailings: u64, stubs_created: u64) -> Result<()>;

    /// Appends a per-file error and counts the file as skipped.
    async fn record_failure(&self, run_id: &str, error: &SyncError) -> Result<()>;

    /// Finalizes a running run. Fails if the run is already terminal.
    async fn finish_run(
        &self,
        run_id: &str,
        status: SyncStatus,
        completed_at: i64,
        fatal_error: Option<&str>,
    ) -> Result<()>;

    /// Full run including every error.
    async fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>>;

    /// Most recent runs first, errors truncated to `error_preview`.
    async fn list_runs(&self, limit: usize, error_preview: usize) -> Result<Vec<RunSummary>>;

    /// The most recently started run, without its errors.
    async fn latest_run(&self) -> Result<Option<SyncRun>>;

    /// Finalizes as `failed` every run still `running` that started before
    /// `started_before`. Returns the ids of the runs it failed.
    async fn fail_stale_runs(
        &self,
        started_before: i64,
        now: i64,
        message: &str,
    ) -> Result<Vec<String>>;
}
