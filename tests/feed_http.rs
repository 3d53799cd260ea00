//! HTTP feed against a local provider stub with basic auth.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use sailsync::config::{Config, CredentialsConfig, FeedKind};
use sailsync::credentials::{CredentialSource, ProviderCredentials, StaticCredentials};
use sailsync::feed::{FeedError, FeedSource, HttpFeed};
use sailsync::ingest::{RunError, SyncRunner};
use sailsync::progress::NoProgress;
use sailsync_core::models::{ErrorType, SyncStatus, SyncTrigger};
use sailsync_core::store::{CatalogStore, RunStore};

use common::{open_store, sailing, test_env};

/// `agent:s3cret`
const EXPECTED_AUTH: &str = "Basic YWdlbnQ6czNjcmV0";

async fn serve_feed(headers: HeaderMap, Path(file): Path<String>) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == EXPECTED_AUTH);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match file.as_str() {
        "manifest.json" => Json(json!({ "files": ["b.json", "missing.json", "a.json", "b.json"] }))
            .into_response(),
        "a.json" => Json(sailing("V-1", "SHIP-42", "2026-04-01", Some("649.00"))).into_response(),
        "b.json" => Json(sailing("V-2", "SHIP-42", "2026-04-08", None)).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_provider() -> SocketAddr {
    let app = Router::new().route("/feed/{file}", get(serve_feed));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http_config(base: &Config, addr: SocketAddr) -> Config {
    let mut config = base.clone();
    config.feed.kind = FeedKind::Http;
    config.feed.root = None;
    config.feed.base_url = Some(format!("http://{addr}/feed/"));
    config
}

fn feed(addr: SocketAddr, username: &str, secret: &str) -> HttpFeed {
    HttpFeed::new(
        format!("http://{addr}/feed"),
        "manifest.json".to_string(),
        ProviderCredentials::new(username, secret),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn lists_and_fetches_with_basic_auth() {
    let addr = start_provider().await;
    let feed = feed(addr, "agent", "s3cret");

    assert_eq!(feed.label(), format!("http:http://{addr}/feed"));
    assert_eq!(
        feed.list_files().await.unwrap(),
        vec!["a.json", "b.json", "missing.json"]
    );

    let body = feed.fetch("a.json").await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["voyage_id"], "V-1");

    let err = feed.fetch("missing.json").await.unwrap_err();
    assert!(matches!(err, FeedError::File(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn rejected_credentials_are_fatal() {
    let addr = start_provider().await;
    let feed = feed(addr, "agent", "wrong");

    let err = feed.list_files().await.unwrap_err();
    assert!(matches!(err, FeedError::Unauthorized(401)));
    assert!(err.is_fatal());
    assert!(matches!(
        feed.fetch("a.json").await.unwrap_err(),
        FeedError::Unauthorized(401)
    ));
}

#[tokio::test]
async fn run_over_http_skips_missing_files() {
    let addr = start_provider().await;
    let env = test_env(2);
    let config = http_config(&env.config, addr);
    let store = open_store(&env).await;
    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredentials(ProviderCredentials::new("agent", "s3cret")));
    let runner = SyncRunner::from_config(
        Arc::clone(&store),
        &config,
        SyncTrigger::Cli,
        Some(credentials),
    );

    let run = runner
        .run(CancellationToken::new(), Arc::new(NoProgress))
        .await
        .unwrap();

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.feed_label, format!("http:http://{addr}/feed"));
    assert_eq!(run.metrics.files_processed, 2);
    assert_eq!(run.metrics.files_skipped, 1);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].file_path, "missing.json");
    assert_eq!(run.errors[0].error_type, ErrorType::Fetch);
    assert!(store.get_sailing("V-2").await.unwrap().is_some());
}

#[tokio::test]
async fn run_with_bad_credentials_fails() {
    let addr = start_provider().await;
    let env = test_env(1);
    let config = http_config(&env.config, addr);
    let store = open_store(&env).await;
    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredentials(ProviderCredentials::new("agent", "nope")));
    let runner = SyncRunner::from_config(
        Arc::clone(&store),
        &config,
        SyncTrigger::Cli,
        Some(credentials),
    );

    let result = runner.run(CancellationToken::new(), Arc::new(NoProgress)).await;
    let Err(RunError::Fatal { run_id, message }) = result else {
        panic!("expected a fatal run error");
    };
    assert!(message.contains("401"), "{message}");

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncStatus::Failed);
    assert_eq!(run.metrics.files_processed, 0);
}

#[tokio::test]
async fn unset_credential_variables_fail_the_run() {
    let addr = start_provider().await;
    let env = test_env(1);
    let mut config = http_config(&env.config, addr);
    config.feed.credentials = CredentialsConfig {
        username_env: Some("SAILSYNC_TEST_UNSET_USER_7f3a".to_string()),
        secret_env: Some("SAILSYNC_TEST_UNSET_SECRET_7f3a".to_string()),
    };
    let store = open_store(&env).await;
    let runner = SyncRunner::from_config(Arc::clone(&store), &config, SyncTrigger::Cli, None);

    let result = runner.run(CancellationToken::new(), Arc::new(NoProgress)).await;
    let Err(RunError::Fatal { run_id, message }) = result else {
        panic!("expected a fatal run error");
    };
    assert!(message.contains("SAILSYNC_TEST_UNSET_USER_7f3a"), "{message}");
    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.fatal_error.as_deref(), Some(message.as_str()));
}
