//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/sailings` | Filtered, sorted, paginated sailing search |
//! | `GET`  | `/sailings/{id}` | One sailing by internal or external id |
//! | `POST` | `/sync/runs` | Start a sync run; processing continues in the background |
//! | `GET`  | `/sync/runs` | Run history, newest first, errors truncated |
//! | `GET`  | `/sync/runs/{id}` | One run with every error |
//! | `POST` | `/sync/runs/{id}/cancel` | Request cooperative cancellation |
//! | `GET`  | `/coverage` | Catalog coverage and the oldest stubs |
//! | `POST` | `/entities/{kind}/{external_id}/confirm` | Confirm a reviewed stub |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "nights_min 9 exceeds nights_max 3" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! Search reads run alongside an active sync; a page reports
//! `sync_in_progress` rather than waiting for the writer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use sailsync_core::coverage;
use sailsync_core::models::{EntityKind, SyncTrigger};
use sailsync_core::search::{
    sailing_detail, search, SearchError, SearchFilters, SearchRequest, SortDir, SortField,
};
use sailsync_core::store::{CatalogStore, RunStore};

use crate::config::Config;
use crate::ingest::{ActiveRuns, RunError, SyncRunner};
use crate::progress::NoProgress;
use crate::search::parse_category;
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    runner: SyncRunner<SqliteStore>,
    active: Arc<ActiveRuns>,
}

impl AppState {
    /// State whose sync runs read the feed named in `config`.
    pub fn new(config: Config, store: Arc<SqliteStore>) -> Self {
        let runner = SyncRunner::from_config(Arc::clone(&store), &config, SyncTrigger::Api, None);
        Self::with_runner(config, store, runner)
    }

    pub fn with_runner(
        config: Config,
        store: Arc<SqliteStore>,
        runner: SyncRunner<SqliteStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            runner,
            active: Arc::new(ActiveRuns::default()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sailings", get(handle_search))
        .route("/sailings/{id}", get(handle_sailing))
        .route("/sync/runs", post(handle_start_run).get(handle_list_runs))
        .route("/sync/runs/{id}", get(handle_get_run))
        .route("/sync/runs/{id}/cancel", post(handle_cancel_run))
        .route("/coverage", get(handle_coverage))
        .route("/entities/{kind}/{external_id}/confirm", post(handle_confirm))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let store = Arc::new(SqliteStore::open(config).await?);
    let app = router(AppState::new(config.clone(), store));

    println!("SailSync API listening on http://{}", bind_addr);
    info!(%bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

/// Logs the full chain; the client only sees a generic message.
fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{err:#}"), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: "internal error".to_string(),
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sailings ============

fn ids(params: &HashMap<String, String>, key: &str) -> Vec<String> {
    params
        .get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parsed<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| bad_request(format!("invalid value for {key}: '{v}'"))),
    }
}

/// Query parameters are taken as strings so malformed values still produce
/// the JSON error body.
fn search_request(params: &HashMap<String, String>) -> Result<SearchRequest, AppError> {
    let cabin_category = match params.get("cabin_category").or_else(|| params.get("cabin")) {
        Some(v) if !v.trim().is_empty() => Some(parse_category(v.trim()).map_err(bad_request)?),
        _ => None,
    };
    let sort_by = match params.get("sort_by").or_else(|| params.get("sort")) {
        Some(v) => SortField::parse(v.trim())
            .ok_or_else(|| bad_request(format!("unknown sort field '{v}'")))?,
        None => SortField::default(),
    };
    let sort_dir = match params.get("sort_dir").or_else(|| params.get("dir")) {
        Some(v) => SortDir::parse(v.trim())
            .ok_or_else(|| bad_request(format!("unknown sort direction '{v}'")))?,
        None => SortDir::default(),
    };

    Ok(SearchRequest {
        filters: SearchFilters {
            text: params.get("text").or_else(|| params.get("q")).cloned(),
            cruise_line_ids: ids(params, "cruise_line_ids"),
            ship_ids: ids(params, "ship_ids"),
            region_ids: ids(params, "region_ids"),
            port_ids: ids(params, "port_ids"),
            ports_visited: ids(params, "ports_visited"),
            sail_date_from: parsed::<NaiveDate>(params, "sail_date_from")?,
            sail_date_to: parsed::<NaiveDate>(params, "sail_date_to")?,
            nights_min: parsed(params, "nights_min")?,
            nights_max: parsed(params, "nights_max")?,
            price_min_cents: parsed(params, "price_min_cents")?,
            price_max_cents: parsed(params, "price_max_cents")?,
            cabin_category,
        },
        page: parsed(params, "page")?,
        page_size: parsed(params, "page_size")?,
        sort_by,
        sort_dir,
    })
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let request = search_request(&params)?;
    match search(&*state.store, &request, state.config.page_limits()).await {
        Ok(page) => Ok(Json(page).into_response()),
        Err(SearchError::InvalidQuery(message)) => Err(bad_request(message)),
        Err(SearchError::Store(e)) => Err(internal(e)),
    }
}

// ============ GET /sailings/{id} ============

async fn handle_sailing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match sailing_detail(&*state.store, &id).await.map_err(internal)? {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(not_found(format!("sailing not found: {id}"))),
    }
}

// ============ /sync/runs ============

#[derive(Serialize)]
struct StartedRun {
    run_id: String,
    status: String,
}

async fn handle_start_run(State(state): State<AppState>) -> Result<Response, AppError> {
    let run = match state.runner.begin().await {
        Ok(run) => run,
        Err(RunError::AlreadyRunning) => {
            return Err(conflict("a sync run is already in progress"))
        }
        Err(RunError::Fatal { message, .. }) => return Err(internal(anyhow::anyhow!(message))),
        Err(RunError::Store(e)) => return Err(internal(e)),
    };

    let token = state.active.register(&run.id);
    let runner = state.runner.clone();
    let active = Arc::clone(&state.active);
    let run_id = run.id.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.execute(&run_id, token, Arc::new(NoProgress)).await {
            warn!(%run_id, error = %e, "background sync run ended with an error");
        }
        active.remove(&run_id);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartedRun {
            run_id: run.id,
            status: run.status.as_str().to_string(),
        }),
    )
        .into_response())
}

async fn handle_list_runs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let limit = parsed::<usize>(&params, "limit")?.unwrap_or(20);
    let runs = state
        .store
        .list_runs(limit, state.config.sync.error_preview)
        .await
        .map_err(internal)?;
    Ok(Json(runs).into_response())
}

async fn handle_get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match state.store.get_run(&id).await.map_err(internal)? {
        Some(run) => Ok(Json(run).into_response()),
        None => Err(not_found(format!("sync run not found: {id}"))),
    }
}

#[derive(Serialize)]
struct CancelResponse {
    run_id: String,
    cancelling: bool,
}

async fn handle_cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if state.active.cancel(&id) {
        info!(run_id = %id, "cancellation requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                run_id: id,
                cancelling: true,
            }),
        )
            .into_response());
    }
    match state.store.get_run(&id).await.map_err(internal)? {
        None => Err(not_found(format!("sync run not found: {id}"))),
        Some(run) if run.status.is_terminal() => {
            Err(conflict(format!("sync run {id} already {}", run.status)))
        }
        Some(_) => Err(conflict(format!(
            "sync run {id} is not executing in this process"
        ))),
    }
}

// ============ GET /coverage ============

async fn handle_coverage(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let oldest = parsed::<usize>(&params, "oldest")?.unwrap_or(state.config.review.oldest_stubs);
    let stats = coverage::report(&*state.store, oldest)
        .await
        .map_err(internal)?;
    Ok(Json(stats).into_response())
}

// ============ POST /entities/{kind}/{external_id}/confirm ============

async fn handle_confirm(
    State(state): State<AppState>,
    Path((kind, external_id)): Path<(String, String)>,
) -> ApiResult<sailsync_core::models::CanonicalEntity> {
    let kind = EntityKind::parse(&kind)
        .ok_or_else(|| bad_request(format!("unknown entity kind '{kind}'")))?;
    match state
        .store
        .confirm_entity(kind, &external_id, Utc::now().timestamp())
        .await
        .map_err(internal)?
    {
        Some(entity) => {
            info!(%kind, %external_id, "entity confirmed");
            Ok(Json(entity))
        }
        None => Err(not_found(format!("{kind} not found: {external_id}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn comma_separated_ids_are_split_and_trimmed() {
        let p = params(&[("ship_ids", "a, b,,c")]);
        assert_eq!(ids(&p, "ship_ids"), vec!["a", "b", "c"]);
        assert!(ids(&p, "region_ids").is_empty());
    }

    #[test]
    fn malformed_values_become_bad_requests() {
        let err = search_request(&params(&[("nights_min", "seven")])).err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = search_request(&params(&[("sort_by", "popularity")])).err().unwrap();
        assert_eq!(err.code, "bad_request");
    }

    #[test]
    fn request_reads_scenario_parameters() {
        let request = search_request(&params(&[
            ("price_max_cents", "50000"),
            ("cabin_category", "inside"),
            ("sort_by", "price"),
            ("sort_dir", "asc"),
            ("page", "1"),
            ("page_size", "20"),
        ]))
        .ok()
        .unwrap();
        assert_eq!(request.filters.price_max_cents, Some(50_000));
        assert_eq!(
            request.filters.cabin_category,
            Some(sailsync_core::models::CabinCategory::Inside)
        );
        assert_eq!(request.sort_by, SortField::Price);
        assert_eq!(request.page_size, Some(20));
    }
}
