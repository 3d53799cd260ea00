//! Core data models shared by the sync pipeline, the stores, and search.
//!
//! These types represent canonical catalog entities, reconciled sailings,
//! and the bookkeeping of sync runs. Timestamps are unix seconds; calendar
//! dates use [`NaiveDate`] and serialize as `YYYY-MM-DD`.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunStateError;

/// The four kinds of canonical catalog entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CruiseLine,
    Ship,
    Port,
    Region,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::CruiseLine,
        EntityKind::Ship,
        EntityKind::Port,
        EntityKind::Region,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CruiseLine => "cruise_line",
            EntityKind::Ship => "ship",
            EntityKind::Port => "port",
            EntityKind::Region => "region",
        }
    }

    /// Parses a kind as written in URLs and on the command line.
    ///
    /// Accepts `cruise_line`, `cruise-line`, and `line` for cruise lines.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cruise_line" | "cruise-line" | "line" => Some(EntityKind::CruiseLine),
            "ship" => Some(EntityKind::Ship),
            "port" => Some(EntityKind::Port),
            "region" => Some(EntityKind::Region),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive attributes of a canonical entity.
///
/// Every field is optional; which ones matter depends on the kind (ports
/// carry coordinates, ships carry their cruise line as `parent_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityAttrs {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub image_url: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub parent_id: Option<String>,
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl EntityAttrs {
    /// Returns a copy with every text field trimmed and empty strings
    /// turned into `None`.
    pub fn normalized(&self) -> Self {
        Self {
            name: clean(&self.name),
            code: clean(&self.code),
            description: clean(&self.description),
            address: clean(&self.address),
            image_url: clean(&self.image_url),
            country: clean(&self.country),
            latitude: self.latitude.filter(|v| v.is_finite()),
            longitude: self.longitude.filter(|v| v.is_finite()),
            parent_id: clean(&self.parent_id),
        }
    }

    /// Folds `incoming` into `self`: known values are replaced only by
    /// non-empty incoming values, never erased.
    pub fn merge_from(&mut self, incoming: &EntityAttrs) {
        let incoming = incoming.normalized();
        fn take<T: Clone>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.name, incoming.name);
        take(&mut self.code, incoming.code);
        take(&mut self.description, incoming.description);
        take(&mut self.address, incoming.address);
        take(&mut self.image_url, incoming.image_url);
        take(&mut self.country, incoming.country);
        take(&mut self.latitude, incoming.latitude);
        take(&mut self.longitude, incoming.longitude);
        take(&mut self.parent_id, incoming.parent_id);
    }
}

/// A deduplicated catalog row addressed by `(kind, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: String,
    pub kind: EntityKind,
    pub external_id: String,
    #[serde(flatten)]
    pub attrs: EntityAttrs,
    pub is_stub: bool,
    pub needs_review: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CanonicalEntity {
    /// A freshly created stub: pending review, carrying whatever was known.
    pub fn new_stub(kind: EntityKind, external_id: &str, attrs: &EntityAttrs, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            external_id: external_id.to_string(),
            attrs: attrs.normalized(),
            is_stub: true,
            needs_review: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.attrs.name.as_deref()
    }

    pub fn has_key_media(&self) -> bool {
        self.attrs.image_url.is_some()
    }

    /// True when an attribute required for a complete record is absent.
    ///
    /// Every kind needs a name; ports also need coordinates and ships
    /// need their cruise line.
    pub fn missing_mandatory(&self) -> bool {
        if self.attrs.name.is_none() {
            return true;
        }
        match self.kind {
            EntityKind::Port => self.attrs.latitude.is_none() || self.attrs.longitude.is_none(),
            EntityKind::Ship => self.attrs.parent_id.is_none(),
            EntityKind::CruiseLine | EntityKind::Region => false,
        }
    }

    pub fn requires_review(&self) -> bool {
        self.is_stub || self.needs_review || self.missing_mandatory()
    }
}

/// Case-folded form of a display name. Text search and name-collision
/// grouping both compare names in this form.
pub fn fold_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Cabin categories that carry a rolled-up price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinCategory {
    Inside,
    Oceanview,
    Balcony,
    Suite,
}

impl CabinCategory {
    pub const ALL: [CabinCategory; 4] = [
        CabinCategory::Inside,
        CabinCategory::Oceanview,
        CabinCategory::Balcony,
        CabinCategory::Suite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CabinCategory::Inside => "inside",
            CabinCategory::Oceanview => "oceanview",
            CabinCategory::Balcony => "balcony",
            CabinCategory::Suite => "suite",
        }
    }

    /// Parses provider category labels, including their single-letter codes.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        match normalized.as_str() {
            "inside" | "interior" | "i" => Some(CabinCategory::Inside),
            "oceanview" | "outside" | "ocean" | "o" => Some(CabinCategory::Oceanview),
            "balcony" | "veranda" | "b" => Some(CabinCategory::Balcony),
            "suite" | "suites" | "s" => Some(CabinCategory::Suite),
            _ => None,
        }
    }
}

impl fmt::Display for CabinCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cabin-grade price point from the feed. Prices are integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinGrade {
    pub code: String,
    pub name: Option<String>,
    pub category: CabinCategory,
    pub price_cents: Option<i64>,
}

/// Per-category price snapshot of a sailing, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinPrices {
    pub inside: Option<i64>,
    pub oceanview: Option<i64>,
    pub balcony: Option<i64>,
    pub suite: Option<i64>,
}

impl CabinPrices {
    pub fn get(&self, category: CabinCategory) -> Option<i64> {
        match category {
            CabinCategory::Inside => self.inside,
            CabinCategory::Oceanview => self.oceanview,
            CabinCategory::Balcony => self.balcony,
            CabinCategory::Suite => self.suite,
        }
    }

    fn slot(&mut self, category: CabinCategory) -> &mut Option<i64> {
        match category {
            CabinCategory::Inside => &mut self.inside,
            CabinCategory::Oceanview => &mut self.oceanview,
            CabinCategory::Balcony => &mut self.balcony,
            CabinCategory::Suite => &mut self.suite,
        }
    }

    /// Lowers the category price to `cents` if it is the new minimum.
    /// Non-positive prices are ignored.
    pub fn offer(&mut self, category: CabinCategory, cents: i64) {
        if cents <= 0 {
            return;
        }
        let slot = self.slot(category);
        *slot = Some(slot.map_or(cents, |current| current.min(cents)));
    }

    /// Rolls grade prices up to the cheapest price per category.
    pub fn from_grades(grades: &[CabinGrade]) -> Self {
        let mut prices = Self::default();
        for grade in grades {
            if let Some(cents) = grade.price_cents {
                prices.offer(grade.category, cents);
            }
        }
        prices
    }

    /// Minimum of the non-null category prices; `None` when all are null.
    pub fn cheapest(&self) -> Option<i64> {
        CabinCategory::ALL
            .iter()
            .filter_map(|c| self.get(*c))
            .min()
    }
}

/// One day of a sailing's itinerary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryStop {
    pub day_number: u32,
    pub port_id: String,
    pub arrival: Option<NaiveDateTime>,
    pub departure: Option<NaiveDateTime>,
}

/// A reconciled, bookable voyage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sailing {
    pub id: String,
    pub external_id: String,
    pub name: Option<String>,
    pub cruise_line_id: String,
    pub ship_id: String,
    pub embark_port_id: Option<String>,
    pub disembark_port_id: Option<String>,
    pub sail_date: NaiveDate,
    pub end_date: NaiveDate,
    pub nights: u32,
    pub itinerary: Vec<ItineraryStop>,
    pub region_ids: Vec<String>,
    pub cabin_grades: Vec<CabinGrade>,
    pub prices: CabinPrices,
    pub cheapest_price: Option<i64>,
    pub currency: Option<String>,
    pub feed_hash: Option<String>,
    pub last_synced_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Operator annotation; never written by the feed upsert.
    pub notes: Option<String>,
}

/// Lifecycle state of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "cancelled" => Some(SyncStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Cli,
    Api,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Cli => "cli",
            SyncTrigger::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(SyncTrigger::Cli),
            "api" => Some(SyncTrigger::Api),
            _ => None,
        }
    }
}

/// Aggregate counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub sailings_upserted: u64,
    pub stubs_created: u64,
}

/// Classification of a per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Fetch,
    Parse,
    Validation,
    Reference,
    Storage,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Fetch => "fetch",
            ErrorType::Parse => "parse",
            ErrorType::Validation => "validation",
            ErrorType::Reference => "reference",
            ErrorType::Storage => "storage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(ErrorType::Fetch),
            "parse" => Some(ErrorType::Parse),
            "validation" => Some(ErrorType::Validation),
            "reference" => Some(ErrorType::Reference),
            "storage" => Some(ErrorType::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-file failure captured by a run. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub file_path: String,
    pub error_type: ErrorType,
    pub message: String,
    pub external_id: Option<String>,
    pub created_at: i64,
}

/// One execution of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: SyncStatus,
    pub trigger: SyncTrigger,
    pub feed_label: String,
    pub metrics: SyncMetrics,
    pub errors: Vec<SyncError>,
    pub fatal_error: Option<String>,
}

impl SyncRun {
    pub fn start(trigger: SyncTrigger, feed_label: &str, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            completed_at: None,
            status: SyncStatus::Running,
            trigger,
            feed_label: feed_label.to_string(),
            metrics: SyncMetrics::default(),
            errors: Vec::new(),
            fatal_error: None,
        }
    }

    fn ensure_running(&self) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            return Err(RunStateError::Terminal {
                run_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn record_success(&mut self, sailings: u64, stubs_created: u64) -> Result<(), RunStateError> {
        self.ensure_running()?;
        self.metrics.files_processed += 1;
        self.metrics.sailings_upserted += sailings;
        self.metrics.stubs_created += stubs_created;
        Ok(())
    }

    pub fn record_failure(&mut self, error: SyncError) -> Result<(), RunStateError> {
        self.ensure_running()?;
        self.metrics.files_skipped += 1;
        self.errors.push(error);
        Ok(())
    }

    /// Moves the run to a terminal status. Succeeds exactly once.
    pub fn finish(
        &mut self,
        status: SyncStatus,
        completed_at: i64,
        fatal_error: Option<&str>,
    ) -> Result<(), RunStateError> {
        if !status.is_terminal() {
            return Err(RunStateError::NotTerminal);
        }
        self.ensure_running()?;
        self.status = status;
        self.completed_at = Some(completed_at);
        self.fatal_error = fatal_error.map(str::to_string);
        Ok(())
    }
}

/// A run as listed in history: errors truncated to a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: SyncRun,
    pub error_count: u64,
    pub errors_truncated: bool,
}

impl RunSummary {
    pub fn from_run(mut run: SyncRun, error_preview: usize) -> Self {
        let error_count = run.errors.len() as u64;
        let errors_truncated = run.errors.len() > error_preview;
        run.errors.truncate(error_preview);
        Self {
            run,
            error_count,
            errors_truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(path: &str) -> SyncError {
        SyncError {
            file_path: path.to_string(),
            error_type: ErrorType::Validation,
            message: "voyage_id: missing".to_string(),
            external_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn cheapest_ignores_nulls() {
        let prices = CabinPrices {
            inside: None,
            oceanview: Some(72_000),
            balcony: Some(91_000),
            suite: None,
        };
        assert_eq!(prices.cheapest(), Some(72_000));
        assert_eq!(CabinPrices::default().cheapest(), None);
    }

    #[test]
    fn offer_keeps_minimum_and_rejects_zero() {
        let mut prices = CabinPrices::default();
        prices.offer(CabinCategory::Inside, 50_000);
        prices.offer(CabinCategory::Inside, 45_000);
        prices.offer(CabinCategory::Inside, 0);
        prices.offer(CabinCategory::Suite, -10);
        assert_eq!(prices.inside, Some(45_000));
        assert_eq!(prices.suite, None);
    }

    #[test]
    fn grades_roll_up_per_category() {
        let grades = vec![
            CabinGrade {
                code: "IA".into(),
                name: None,
                category: CabinCategory::Inside,
                price_cents: Some(60_000),
            },
            CabinGrade {
                code: "IB".into(),
                name: None,
                category: CabinCategory::Inside,
                price_cents: Some(55_000),
            },
            CabinGrade {
                code: "B1".into(),
                name: None,
                category: CabinCategory::Balcony,
                price_cents: None,
            },
        ];
        let prices = CabinPrices::from_grades(&grades);
        assert_eq!(prices.inside, Some(55_000));
        assert_eq!(prices.balcony, None);
        assert_eq!(prices.cheapest(), Some(55_000));
    }

    #[test]
    fn cabin_category_aliases() {
        assert_eq!(CabinCategory::parse("Interior"), Some(CabinCategory::Inside));
        assert_eq!(CabinCategory::parse("ocean view"), Some(CabinCategory::Oceanview));
        assert_eq!(CabinCategory::parse("B"), Some(CabinCategory::Balcony));
        assert_eq!(CabinCategory::parse("penthouse"), None);
    }

    #[test]
    fn merge_never_erases_known_values() {
        let mut attrs = EntityAttrs {
            name: Some("Miami".into()),
            latitude: Some(25.77),
            ..Default::default()
        };
        attrs.merge_from(&EntityAttrs {
            name: Some("   ".into()),
            code: Some("MIA".into()),
            ..Default::default()
        });
        assert_eq!(attrs.name.as_deref(), Some("Miami"));
        assert_eq!(attrs.code.as_deref(), Some("MIA"));
        assert_eq!(attrs.latitude, Some(25.77));
    }

    #[test]
    fn port_without_coordinates_is_incomplete() {
        let attrs = EntityAttrs {
            name: Some("St. Thomas".into()),
            ..Default::default()
        };
        let mut port = CanonicalEntity::new_stub(EntityKind::Port, "STT", &attrs, 10);
        assert!(port.missing_mandatory());
        port.attrs.latitude = Some(18.34);
        port.attrs.longitude = Some(-64.93);
        assert!(!port.missing_mandatory());
        assert!(port.requires_review(), "stubs always need review");
    }

    #[test]
    fn run_finishes_exactly_once() {
        let mut run = SyncRun::start(SyncTrigger::Cli, "directory:/feed", 100);
        run.record_success(1, 2).unwrap();
        run.record_failure(error("a.json")).unwrap();
        run.finish(SyncStatus::Completed, 200, None).unwrap();

        assert_eq!(run.metrics.files_processed, 1);
        assert_eq!(run.metrics.files_skipped, 1);
        assert_eq!(run.metrics.stubs_created, 2);
        assert!(run.finish(SyncStatus::Failed, 300, Some("late")).is_err());
        assert!(run.record_failure(error("b.json")).is_err());
        assert_eq!(run.status, SyncStatus::Completed);
        assert_eq!(run.completed_at, Some(200));
    }

    #[test]
    fn run_cannot_finish_as_running() {
        let mut run = SyncRun::start(SyncTrigger::Api, "directory:/feed", 0);
        assert_eq!(
            run.finish(SyncStatus::Running, 1, None),
            Err(RunStateError::NotTerminal)
        );
    }

    #[test]
    fn summary_truncates_errors_but_keeps_count() {
        let mut run = SyncRun::start(SyncTrigger::Cli, "x", 0);
        for i in 0..5 {
            run.record_failure(error(&format!("{i}.json"))).unwrap();
        }
        let summary = RunSummary::from_run(run, 2);
        assert_eq!(summary.error_count, 5);
        assert_eq!(summary.run.errors.len(), 2);
        assert!(summary.errors_truncated);
    }
}
