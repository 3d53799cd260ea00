//! Sailing search semantics.
//!
//! A [`SearchRequest`] is normalized against [`PageLimits`] into a
//! [`SearchQuery`], which stores execute. The SQLite store translates the
//! query into SQL; the in-memory store evaluates [`SearchQuery::matches`]
//! and [`SearchQuery::compare`] directly. Both follow the same rules:
//!
//! - Filters are conjunctive. Within one id list any listed id matches.
//! - `port_ids` matches the embarkation or disembarkation port.
//! - `ports_visited` requires every listed port somewhere in the itinerary.
//! - A price bound applies to one cabin category (the cheapest price when
//!   none is given) and excludes rows whose price in that column is null.
//! - Sorting puts nulls last in both directions and breaks ties by
//!   internal id ascending.
//!
//! Search never waits on ingestion: `sync_in_progress` is read from the
//! latest run at request time, and a failure to read it is logged, not
//! returned.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::models::{fold_name, CabinCategory, CabinPrices, ItineraryStop, Sailing, SyncStatus};
use crate::store::{CatalogStore, RunStore};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    SailDate,
    Price,
    Nights,
    ShipName,
    LineName,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sail_date" => Some(SortField::SailDate),
            "price" => Some(SortField::Price),
            "nights" => Some(SortField::Nights),
            "ship_name" => Some(SortField::ShipName),
            "line_name" => Some(SortField::LineName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortDir::Asc),
            "desc" => Some(SortDir::Desc),
            _ => None,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortDir::Asc => ordering,
            SortDir::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Case-insensitive substring of the sailing, ship, line, or any port name.
    pub text: Option<String>,
    pub cruise_line_ids: Vec<String>,
    pub ship_ids: Vec<String>,
    pub region_ids: Vec<String>,
    pub port_ids: Vec<String>,
    pub ports_visited: Vec<String>,
    pub sail_date_from: Option<NaiveDate>,
    pub sail_date_to: Option<NaiveDate>,
    pub nights_min: Option<u32>,
    pub nights_max: Option<u32>,
    pub price_min_cents: Option<i64>,
    pub price_max_cents: Option<i64>,
    pub cabin_category: Option<CabinCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub filters: SearchFilters,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A normalized request: page bounds applied, text lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub filters: SearchFilters,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
}

fn clean_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|o| o == id) {
            out.push(id.to_string());
        }
    }
    out
}

impl SearchRequest {
    pub fn normalize(&self, limits: PageLimits) -> Result<SearchQuery, SearchError> {
        let f = &self.filters;
        if let (Some(from), Some(to)) = (f.sail_date_from, f.sail_date_to) {
            if from > to {
                return Err(SearchError::InvalidQuery(format!(
                    "sail_date_from {from} is after sail_date_to {to}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (f.nights_min, f.nights_max) {
            if min > max {
                return Err(SearchError::InvalidQuery(format!(
                    "nights_min {min} exceeds nights_max {max}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (f.price_min_cents, f.price_max_cents) {
            if min > max {
                return Err(SearchError::InvalidQuery(format!(
                    "price_min_cents {min} exceeds price_max_cents {max}"
                )));
            }
        }

        let page_size = match self.page_size {
            None | Some(0) => limits.default_page_size,
            Some(n) => n,
        }
        .clamp(1, limits.max_page_size.max(1));

        let filters = SearchFilters {
            text: f
                .text
                .as_deref()
                .map(fold_name)
                .filter(|t| !t.is_empty()),
            cruise_line_ids: clean_ids(&f.cruise_line_ids),
            ship_ids: clean_ids(&f.ship_ids),
            region_ids: clean_ids(&f.region_ids),
            port_ids: clean_ids(&f.port_ids),
            ports_visited: clean_ids(&f.ports_visited),
            ..f.clone()
        };

        Ok(SearchQuery {
            filters,
            page: self.page.unwrap_or(1).max(1),
            page_size,
            sort_by: self.sort_by,
            sort_dir: self.sort_dir,
        })
    }
}

/// Denormalized sailing row returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SailingSummary {
    pub id: String,
    pub external_id: String,
    pub name: Option<String>,
    pub cruise_line_id: String,
    pub cruise_line_name: Option<String>,
    pub ship_id: String,
    pub ship_name: Option<String>,
    pub embark_port_id: Option<String>,
    pub embark_port_name: Option<String>,
    pub disembark_port_id: Option<String>,
    pub disembark_port_name: Option<String>,
    pub sail_date: NaiveDate,
    pub end_date: NaiveDate,
    pub nights: u32,
    pub prices: CabinPrices,
    pub cheapest_price: Option<i64>,
    pub currency: Option<String>,
    pub last_synced_at: i64,
}

/// One page of matches as returned by a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SailingPage {
    pub items: Vec<SailingSummary>,
    /// Matches across all pages.
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultPage {
    pub items: Vec<SailingSummary>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_more: bool,
    pub sync_in_progress: bool,
}

/// What an in-memory matcher needs beyond the summary row.
pub struct SearchCandidate<'a> {
    pub summary: &'a SailingSummary,
    pub region_ids: &'a [String],
    pub stop_port_ids: &'a [String],
    pub stop_port_names: &'a [String],
}

fn nulls_last<T: Ord>(a: Option<T>, b: Option<T>, dir: SortDir) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => dir.apply(x.cmp(&y)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl SearchQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// The price a bound or a price sort applies to.
    pub fn price_of(&self, summary: &SailingSummary) -> Option<i64> {
        match self.filters.cabin_category {
            Some(category) => summary.prices.get(category),
            None => summary.cheapest_price,
        }
    }

    pub fn matches(&self, candidate: &SearchCandidate<'_>) -> bool {
        let f = &self.filters;
        let s = candidate.summary;

        if let Some(text) = &f.text {
            let hit = [
                &s.name,
                &s.ship_name,
                &s.cruise_line_name,
                &s.embark_port_name,
                &s.disembark_port_name,
            ]
            .into_iter()
            .flatten()
            .chain(candidate.stop_port_names)
            .any(|name| fold_name(name).contains(text.as_str()));
            if !hit {
                return false;
            }
        }

        if !f.cruise_line_ids.is_empty() && !f.cruise_line_ids.contains(&s.cruise_line_id) {
            return false;
        }
        if !f.ship_ids.is_empty() && !f.ship_ids.contains(&s.ship_id) {
            return false;
        }
        if !f.region_ids.is_empty() && !candidate.region_ids.iter().any(|r| f.region_ids.contains(r)) {
            return false;
        }
        if !f.port_ids.is_empty() {
            let at_ends = [&s.embark_port_id, &s.disembark_port_id]
                .into_iter()
                .flatten()
                .any(|p| f.port_ids.contains(p));
            if !at_ends {
                return false;
            }
        }
        if !f
            .ports_visited
            .iter()
            .all(|p| candidate.stop_port_ids.contains(p))
        {
            return false;
        }

        if f.sail_date_from.is_some_and(|d| s.sail_date < d)
            || f.sail_date_to.is_some_and(|d| s.sail_date > d)
            || f.nights_min.is_some_and(|n| s.nights < n)
            || f.nights_max.is_some_and(|n| s.nights > n)
        {
            return false;
        }

        if f.price_min_cents.is_some() || f.price_max_cents.is_some() {
            let Some(price) = self.price_of(s) else {
                return false;
            };
            if f.price_min_cents.is_some_and(|min| price < min)
                || f.price_max_cents.is_some_and(|max| price > max)
            {
                return false;
            }
        }
        true
    }

    pub fn compare(&self, a: &SailingSummary, b: &SailingSummary) -> Ordering {
        let dir = self.sort_dir;
        let lower = |s: &Option<String>| s.as_deref().map(fold_name);
        let primary = match self.sort_by {
            SortField::SailDate => nulls_last(Some(a.sail_date), Some(b.sail_date), dir),
            SortField::Price => nulls_last(self.price_of(a), self.price_of(b), dir),
            SortField::Nights => nulls_last(Some(a.nights), Some(b.nights), dir),
            SortField::ShipName => nulls_last(lower(&a.ship_name), lower(&b.ship_name), dir),
            SortField::LineName => {
                nulls_last(lower(&a.cruise_line_name), lower(&b.cruise_line_name), dir)
            }
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn total_pages(total: u64, page_size: u32) -> u64 {
    total.div_ceil(u64::from(page_size.max(1)))
}

/// Runs a search and reports whether a sync is in progress.
pub async fn search<S>(
    store: &S,
    request: &SearchRequest,
    limits: PageLimits,
) -> Result<SearchResultPage, SearchError>
where
    S: CatalogStore + RunStore + ?Sized,
{
    let query = request.normalize(limits)?;
    let page = store.query_sailings(&query).await?;

    let sync_in_progress = match store.latest_run().await {
        Ok(run) => run.is_some_and(|r| r.status == SyncStatus::Running),
        Err(e) => {
            warn!(error = %e, "could not read latest sync run");
            false
        }
    };

    let total_pages = total_pages(page.total, query.page_size);
    Ok(SearchResultPage {
        items: page.items,
        page: query.page,
        page_size: query.page_size,
        total: page.total,
        total_pages,
        has_more: u64::from(query.page) < total_pages,
        sync_in_progress,
    })
}

/// A reference with its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopDetail {
    #[serde(flatten)]
    pub stop: ItineraryStop,
    pub port_name: Option<String>,
}

/// A sailing with names resolved for every reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SailingDetail {
    pub sailing: Sailing,
    pub cruise_line: NamedRef,
    pub ship: NamedRef,
    pub embark_port: Option<NamedRef>,
    pub disembark_port: Option<NamedRef>,
    pub itinerary: Vec<StopDetail>,
    pub regions: Vec<NamedRef>,
}

/// Fetches one sailing by internal or external id, with names attached.
pub async fn sailing_detail<S: CatalogStore + ?Sized>(
    store: &S,
    id: &str,
) -> anyhow::Result<Option<SailingDetail>> {
    let Some(sailing) = store.get_sailing(id).await? else {
        return Ok(None);
    };

    let mut ids = vec![sailing.cruise_line_id.clone(), sailing.ship_id.clone()];
    ids.extend(sailing.embark_port_id.iter().cloned());
    ids.extend(sailing.disembark_port_id.iter().cloned());
    ids.extend(sailing.itinerary.iter().map(|s| s.port_id.clone()));
    ids.extend(sailing.region_ids.iter().cloned());
    ids.sort();
    ids.dedup();
    let names = store.entity_names(&ids).await?;

    let named = |id: &String| NamedRef {
        id: id.clone(),
        name: names.get(id).cloned(),
    };

    Ok(Some(SailingDetail {
        cruise_line: named(&sailing.cruise_line_id),
        ship: named(&sailing.ship_id),
        embark_port: sailing.embark_port_id.as_ref().map(named),
        disembark_port: sailing.disembark_port_id.as_ref().map(named),
        itinerary: sailing
            .itinerary
            .iter()
            .map(|stop| StopDetail {
                stop: stop.clone(),
                port_name: names.get(&stop.port_id).cloned(),
            })
            .collect(),
        regions: sailing.region_ids.iter().map(named).collect(),
        sailing,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{parse_record, validate};
    use crate::models::{EntityKind, SyncRun, SyncTrigger};
    use crate::resolve::resolve_refs;
    use crate::store::memory::InMemoryStore;
    use crate::upsert::upsert;
    use serde_json::json;

    async fn load(store: &InMemoryStore, record: serde_json::Value) {
        let raw = parse_record(record.to_string().as_bytes()).unwrap();
        let (validated, _) = validate(&raw).unwrap();
        let refs = resolve_refs(store, &validated).await.unwrap();
        upsert(store, &validated, &refs, None).await.unwrap();
    }

    fn sailing(id: &str, ship: &str, date: &str, nights: u32, inside: Option<&str>) -> serde_json::Value {
        json!({
            "voyage_id": id,
            "line": { "id": "RCL", "name": "Royal Caribbean" },
            "ship": { "id": ship, "name": format!("{ship} of the Seas") },
            "sail_date": date,
            "nights": nights,
            "itinerary": [
                { "day": 1, "port": { "id": "MIA", "name": "Miami" } },
                { "day": 2, "port": { "id": "NAS", "name": "Nassau" } }
            ],
            "prices": { "inside": inside, "balcony": "900" }
        })
    }

    async fn fixture() -> InMemoryStore {
        let store = InMemoryStore::new();
        load(&store, sailing("A", "Wonder", "2026-03-01", 7, Some("450"))).await;
        load(&store, sailing("B", "Icon", "2026-02-01", 3, Some("499.99"))).await;
        load(&store, sailing("C", "Utopia", "2026-04-01", 4, None)).await;
        load(&store, sailing("D", "Oasis", "2026-05-01", 5, Some("650"))).await;
        let mut cozumel = sailing("E", "Icon", "2026-06-01", 7, Some("300"));
        cozumel["itinerary"][1]["port"] = json!({ "id": "CZM", "name": "Cozumel" });
        load(&store, cozumel).await;
        store
    }

    fn ids(page: &SearchResultPage) -> Vec<String> {
        page.items.iter().map(|i| i.external_id.clone()).collect()
    }

    #[test]
    fn normalize_applies_page_limits() {
        let limits = PageLimits {
            default_page_size: 20,
            max_page_size: 50,
        };
        let q = SearchRequest::default().normalize(limits).unwrap();
        assert_eq!((q.page, q.page_size), (1, 20));

        let q = SearchRequest {
            page: Some(0),
            page_size: Some(500),
            ..Default::default()
        }
        .normalize(limits)
        .unwrap();
        assert_eq!((q.page, q.page_size), (1, 50));
        assert_eq!(q.offset(), 0);
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let request = SearchRequest {
            filters: SearchFilters {
                nights_min: Some(9),
                nights_max: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            request.normalize(PageLimits::default()),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn inside_price_bound_excludes_nulls_and_sorts_ascending() {
        let store = fixture().await;
        let request = SearchRequest {
            filters: SearchFilters {
                price_max_cents: Some(50_000),
                cabin_category: Some(CabinCategory::Inside),
                ..Default::default()
            },
            page: Some(1),
            page_size: Some(20),
            sort_by: SortField::Price,
            sort_dir: SortDir::Asc,
        };
        let page = search(&store, &request, PageLimits::default()).await.unwrap();

        assert_eq!(ids(&page), vec!["E", "A", "B"]);
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 1);
        assert!(!page.has_more);
        for item in &page.items {
            assert!(item.prices.inside.is_some_and(|p| p <= 50_000));
        }
    }

    #[tokio::test]
    async fn text_matches_accented_capitals() {
        let store = fixture().await;
        let mut record = sailing("F", "Icon", "2026-07-01", 7, Some("400"));
        record["itinerary"][1]["port"] = json!({ "id": "ILP", "name": "Île des Pins" });
        load(&store, record).await;

        for text in ["île des", "ÎLE DES", " Île des Pins "] {
            let request = SearchRequest {
                filters: SearchFilters {
                    text: Some(text.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let page = search(&store, &request, PageLimits::default()).await.unwrap();
            assert_eq!(ids(&page), vec!["F"], "{text}");
        }
    }

    #[tokio::test]
    async fn nulls_sort_last_in_both_directions() {
        let store = fixture().await;
        for dir in [SortDir::Asc, SortDir::Desc] {
            let request = SearchRequest {
                filters: SearchFilters {
                    cabin_category: Some(CabinCategory::Inside),
                    ..Default::default()
                },
                sort_by: SortField::Price,
                sort_dir: dir,
                ..Default::default()
            };
            let page = search(&store, &request, PageLimits::default()).await.unwrap();
            assert_eq!(page.items.last().unwrap().external_id, "C");
        }
    }

    #[tokio::test]
    async fn ports_visited_requires_every_port() {
        let store = fixture().await;
        let miami = store.get_entity(EntityKind::Port, "MIA").await.unwrap().unwrap();
        let cozumel = store.get_entity(EntityKind::Port, "CZM").await.unwrap().unwrap();
        let request = SearchRequest {
            filters: SearchFilters {
                ports_visited: vec![miami.id, cozumel.id],
                ..Default::default()
            },
            ..Default::default()
        };
        let page = search(&store, &request, PageLimits::default()).await.unwrap();
        assert_eq!(ids(&page), vec!["E"]);
    }

    #[tokio::test]
    async fn text_matches_port_names_case_insensitively() {
        let store = fixture().await;
        let request = SearchRequest {
            filters: SearchFilters {
                text: Some("  COZU ".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let page = search(&store, &request, PageLimits::default()).await.unwrap();
        assert_eq!(ids(&page), vec!["E"]);
    }

    #[tokio::test]
    async fn pagination_and_default_sort() {
        let store = fixture().await;
        let request = SearchRequest {
            page: Some(2),
            page_size: Some(2),
            ..Default::default()
        };
        let page = search(&store, &request, PageLimits::default()).await.unwrap();
        // sail_date asc: B, A, C, D, E
        assert_eq!(ids(&page), vec!["C", "D"]);
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn ship_name_ties_break_by_id() {
        let store = fixture().await;
        let request = SearchRequest {
            filters: SearchFilters {
                text: Some("icon".into()),
                ..Default::default()
            },
            sort_by: SortField::ShipName,
            ..Default::default()
        };
        let page = search(&store, &request, PageLimits::default()).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].id < page.items[1].id);
    }

    #[tokio::test]
    async fn reports_running_sync() {
        let store = fixture().await;
        let request = SearchRequest::default();
        let before = search(&store, &request, PageLimits::default()).await.unwrap();
        assert!(!before.sync_in_progress);

        let run = SyncRun::start(SyncTrigger::Cli, "test", 0);
        assert!(store.start_run(&run).await.unwrap());
        let during = search(&store, &request, PageLimits::default()).await.unwrap();
        assert!(during.sync_in_progress);
        assert_eq!(during.total, before.total);
    }

    #[tokio::test]
    async fn detail_resolves_names() {
        let store = fixture().await;
        let detail = sailing_detail(&store, "E").await.unwrap().unwrap();
        assert_eq!(detail.ship.name.as_deref(), Some("Icon of the Seas"));
        assert_eq!(detail.cruise_line.name.as_deref(), Some("Royal Caribbean"));
        let ports: Vec<Option<&str>> = detail
            .itinerary
            .iter()
            .map(|s| s.port_name.as_deref())
            .collect();
        assert_eq!(ports, vec![Some("Miami"), Some("Cozumel")]);
        assert!(sailing_detail(&store, "missing").await.unwrap().is_none());
    }
}
