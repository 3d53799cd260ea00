//! In-memory [`CatalogStore`] and [`RunStore`] for tests and embedded use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Each operation
//! takes one write lock, which makes it atomic. Search is a full scan using
//! [`SearchQuery::matches`] and [`SearchQuery::compare`].

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::coverage::{self, CoverageStats};
use crate::models::{
    CanonicalEntity, EntityAttrs, EntityKind, RunSummary, Sailing, SyncError, SyncRun, SyncStatus,
};
use crate::search::{SailingPage, SailingSummary, SearchCandidate, SearchQuery};
use crate::upsert::SailingUpsert;

use super::{CatalogStore, Resolution, RunStore};

#[derive(Default)]
struct Catalog {
    entities: HashMap<(EntityKind, String), CanonicalEntity>,
    /// Keyed by external id.
    sailings: HashMap<String, Sailing>,
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStore {
    catalog: RwLock<Catalog>,
    runs: RwLock<Vec<SyncRun>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operator annotation on a sailing.
    pub fn set_notes(&self, sailing_id: &str, notes: &str) -> Result<()> {
        let mut catalog = write(&self.catalog)?;
        let Some(sailing) = catalog.sailings.values_mut().find(|s| s.id == sailing_id) else {
            bail!("unknown sailing {sailing_id}");
        };
        sailing.notes = Some(notes.to_string());
        Ok(())
    }
}

fn summarize(sailing: &Sailing, by_id: &HashMap<&str, &CanonicalEntity>) -> SailingSummary {
    let name = |id: &str| by_id.get(id).and_then(|e| e.attrs.name.clone());
    SailingSummary {
        id: sailing.id.clone(),
        external_id: sailing.external_id.clone(),
        name: sailing.name.clone(),
        cruise_line_id: sailing.cruise_line_id.clone(),
        cruise_line_name: name(&sailing.cruise_line_id),
        ship_id: sailing.ship_id.clone(),
        ship_name: name(&sailing.ship_id),
        embark_port_id: sailing.embark_port_id.clone(),
        embark_port_name: sailing.embark_port_id.as_deref().and_then(name),
        disembark_port_id: sailing.disembark_port_id.clone(),
        disembark_port_name: sailing.disembark_port_id.as_deref().and_then(name),
        sail_date: sailing.sail_date,
        end_date: sailing.end_date,
        nights: sailing.nights,
        prices: sailing.prices,
        cheapest_price: sailing.cheapest_price,
        currency: sailing.currency.clone(),
        last_synced_at: sailing.last_synced_at,
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn resolve_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        attrs: &EntityAttrs,
        now: i64,
    ) -> Result<Resolution> {
        let mut catalog = write(&self.catalog)?;
        let key = (kind, external_id.to_string());
        if let Some(entity) = catalog.entities.get_mut(&key) {
            let before = entity.attrs.clone();
            entity.attrs.merge_from(attrs);
            if entity.attrs != before {
                entity.updated_at = now;
            }
            return Ok(Resolution {
                entity: entity.clone(),
                created: false,
            });
        }
        let entity = CanonicalEntity::new_stub(kind, external_id, attrs, now);
        catalog.entities.insert(key, entity.clone());
        Ok(Resolution {
            entity,
            created: true,
        })
    }

    async fn get_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<CanonicalEntity>> {
        let catalog = read(&self.catalog)?;
        Ok(catalog.entities.get(&(kind, external_id.to_string())).cloned())
    }

    async fn entity_names(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let catalog = read(&self.catalog)?;
        Ok(catalog
            .entities
            .values()
            .filter(|e| wanted.contains(e.id.as_str()))
            .filter_map(|e| e.attrs.name.clone().map(|n| (e.id.clone(), n)))
            .collect())
    }

    async fn confirm_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        now: i64,
    ) -> Result<Option<CanonicalEntity>> {
        let mut catalog = write(&self.catalog)?;
        let Some(entity) = catalog.entities.get_mut(&(kind, external_id.to_string())) else {
            return Ok(None);
        };
        entity.is_stub = false;
        entity.needs_review = false;
        entity.updated_at = now;
        Ok(Some(entity.clone()))
    }

    async fn upsert_sailing(&self, row: &SailingUpsert) -> Result<Sailing> {
        let mut catalog = write(&self.catalog)?;
        let sailing = match catalog.sailings.get_mut(&row.external_id) {
            Some(existing) => {
                row.apply_to(existing);
                existing.clone()
            }
            None => {
                let sailing = row.clone().into_new_sailing();
                catalog
                    .sailings
                    .insert(sailing.external_id.clone(), sailing.clone());
                sailing
            }
        };
        Ok(sailing)
    }

    async fn get_sailing(&self, id: &str) -> Result<Option<Sailing>> {
        let catalog = read(&self.catalog)?;
        Ok(catalog
            .sailings
            .values()
            .find(|s| s.id == id)
            .or_else(|| catalog.sailings.get(id))
            .cloned())
    }

    async fn query_sailings(&self, query: &SearchQuery) -> Result<SailingPage> {
        let catalog = read(&self.catalog)?;
        let by_id: HashMap<&str, &CanonicalEntity> = catalog
            .entities
            .values()
            .map(|e| (e.id.as_str(), e))
            .collect();

        let mut matched: Vec<SailingSummary> = Vec::new();
        for sailing in catalog.sailings.values() {
            let summary = summarize(sailing, &by_id);
            let stop_port_ids: Vec<String> =
                sailing.itinerary.iter().map(|s| s.port_id.clone()).collect();
            let stop_port_names: Vec<String> = sailing
                .itinerary
                .iter()
                .filter_map(|s| by_id.get(s.port_id.as_str()))
                .filter_map(|e| e.attrs.name.clone())
                .collect();
            let candidate = SearchCandidate {
                summary: &summary,
                region_ids: &sailing.region_ids,
                stop_port_ids: &stop_port_ids,
                stop_port_names: &stop_port_names,
            };
            if query.matches(&candidate) {
                matched.push(summary);
            }
        }

        matched.sort_by(|a, b| query.compare(a, b));
        let total = matched.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let items = matched
            .into_iter()
            .skip(offset)
            .take(query.page_size as usize)
            .collect();
        Ok(SailingPage { items, total })
    }

    async fn coverage(&self, oldest_limit: usize, now: i64) -> Result<CoverageStats> {
        let catalog = read(&self.catalog)?;
        let entities: Vec<CanonicalEntity> = catalog.entities.values().cloned().collect();
        Ok(coverage::compute(&entities, oldest_limit, now))
    }
}

fn run_mut<'a>(runs: &'a mut [SyncRun], run_id: &str) -> Result<&'a mut SyncRun> {
    runs.iter_mut()
        .find(|r| r.id == run_id)
        .ok_or_else(|| anyhow!("unknown sync run {run_id}"))
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn start_run(&self, run: &SyncRun) -> Result<bool> {
        let mut runs = write(&self.runs)?;
        if runs.iter().any(|r| r.status == SyncStatus::Running) {
            return Ok(false);
        }
        runs.push(run.clone());
        Ok(true)
    }

    async fn record_success(&self, run_id: &str, sailings: u64, stubs_created: u64) -> Result<()> {
        let mut runs = write(&self.runs)?;
        run_mut(&mut runs, run_id)?.record_success(sailings, stubs_created)?;
        Ok(())
    }

    async fn record_failure(&self, run_id: &str, error: &SyncError) -> Result<()> {
        let mut runs = write(&self.runs)?;
        run_mut(&mut runs, run_id)?.record_failure(error.clone())?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: SyncStatus,
        completed_at: i64,
        fatal_error: Option<&str>,
    ) -> Result<()> {
        let mut runs = write(&self.runs)?;
        run_mut(&mut runs, run_id)?.finish(status, completed_at, fatal_error)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let runs = read(&self.runs)?;
        Ok(runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn list_runs(&self, limit: usize, error_preview: usize) -> Result<Vec<RunSummary>> {
        let runs = read(&self.runs)?;
        let mut newest_first: Vec<&SyncRun> = runs.iter().rev().collect();
        newest_first.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(newest_first
            .into_iter()
            .take(limit)
            .map(|r| RunSummary::from_run(r.clone(), error_preview))
            .collect())
    }

    async fn latest_run(&self) -> Result<Option<SyncRun>> {
        let runs = read(&self.runs)?;
        Ok(runs.iter().max_by_key(|r| r.started_at).map(|r| SyncRun {
            errors: Vec::new(),
            ..r.clone()
        }))
    }

    async fn fail_stale_runs(
        &self,
        started_before: i64,
        now: i64,
        message: &str,
    ) -> Result<Vec<String>> {
        let mut runs = write(&self.runs)?;
        let mut failed = Vec::new();
        for run in runs
            .iter_mut()
            .filter(|r| r.status == SyncStatus::Running && r.started_at < started_before)
        {
            run.finish(SyncStatus::Failed, now, Some(message))?;
            failed.push(run.id.clone());
        }
        Ok(failed)
    }
}
