//! End-to-end sync runs against a SQLite store and a directory feed.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sailsync::feed::{DirectoryFeed, FeedError, FeedSource};
use sailsync::ingest::{RunError, RunOptions, SyncRunner, ABANDONED_MESSAGE};
use sailsync::progress::NoProgress;
use sailsync::sqlite_store::SqliteStore;
use sailsync_core::models::{EntityKind, ErrorType, SyncRun, SyncStatus, SyncTrigger};
use sailsync_core::search::{search, SearchFilters, SearchRequest, SortField};
use sailsync_core::store::{CatalogStore, RunStore};

use common::{open_store, sailing, test_env, write_raw, write_record, TestEnv};

fn runner(env: &TestEnv, store: &Arc<SqliteStore>) -> SyncRunner<SqliteStore> {
    SyncRunner::from_config(Arc::clone(store), &env.config, SyncTrigger::Cli, None)
}

async fn sync(env: &TestEnv, store: &Arc<SqliteStore>) -> SyncRun {
    runner(env, store)
        .run(CancellationToken::new(), Arc::new(NoProgress))
        .await
        .unwrap()
}

#[tokio::test]
async fn resync_is_idempotent() {
    let env = test_env(2);
    write_record(&env.feed_dir, "a.json", &sailing("V-100", "SHIP-42", "2026-03-01", Some("649.00")));
    write_record(&env.feed_dir, "b.json", &sailing("V-101", "SHIP-42", "2026-03-08", Some("699.00")));
    let store = open_store(&env).await;

    let first = sync(&env, &store).await;
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(first.metrics.files_processed, 2);
    assert_eq!(first.metrics.sailings_upserted, 2);
    let before = store.get_sailing("V-100").await.unwrap().unwrap();

    let second = sync(&env, &store).await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.metrics.files_processed, 2);
    assert_eq!(second.metrics.stubs_created, 0);

    let after = store.get_sailing("V-100").await.unwrap().unwrap();
    assert_eq!(before.id, after.id);
    assert_eq!(before.created_at, after.created_at);
    assert_eq!(after.itinerary.len(), 3);
    assert_eq!(after.cabin_grades.len(), 2);

    let coverage = store.coverage(10, Utc::now().timestamp()).await.unwrap();
    assert_eq!(coverage.kind(EntityKind::Ship).unwrap().total, 1);
    assert_eq!(coverage.kind(EntityKind::Port).unwrap().total, 2);
}

#[tokio::test]
async fn shared_unknown_ship_becomes_one_stub() {
    let env = test_env(2);
    write_record(&env.feed_dir, "a.json", &sailing("V-100", "SHIP-42", "2026-03-01", None));
    write_record(&env.feed_dir, "b.json", &sailing("V-101", "SHIP-42", "2026-03-08", None));
    let store = open_store(&env).await;

    let run = sync(&env, &store).await;

    // line, ship, two ports, one region
    assert_eq!(run.metrics.stubs_created, 5);
    let ship = store
        .get_entity(EntityKind::Ship, "SHIP-42")
        .await
        .unwrap()
        .unwrap();
    assert!(ship.is_stub);
    assert!(ship.needs_review);

    let a = store.get_sailing("V-100").await.unwrap().unwrap();
    let b = store.get_sailing("V-101").await.unwrap().unwrap();
    assert_eq!(a.ship_id, ship.id);
    assert_eq!(b.ship_id, ship.id);
    assert_eq!(ship.attrs.parent_id.as_deref(), Some(a.cruise_line_id.as_str()));
}

#[tokio::test]
async fn bad_files_are_skipped_and_recorded() {
    let env = test_env(2);
    for (i, voyage) in ["V-1", "V-2", "V-3"].iter().enumerate() {
        write_record(
            &env.feed_dir,
            &format!("good-{i}.json"),
            &sailing(voyage, "SHIP-42", "2026-04-01", Some("500.00")),
        );
    }
    write_raw(&env.feed_dir, "broken.json", "{ \"voyage_id\": ");
    write_raw(&env.feed_dir, "empty.json", r#"{"name": "Nowhere"}"#);
    let store = open_store(&env).await;

    let run = sync(&env, &store).await;

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.metrics.files_processed, 3);
    assert_eq!(run.metrics.files_skipped, 2);
    assert_eq!(run.metrics.sailings_upserted, 3);
    assert_eq!(run.errors.len(), 2);

    let broken = run.errors.iter().find(|e| e.file_path == "broken.json").unwrap();
    assert_eq!(broken.error_type, ErrorType::Parse);
    let empty = run.errors.iter().find(|e| e.file_path == "empty.json").unwrap();
    assert_eq!(empty.error_type, ErrorType::Validation);
    for field in ["voyage_id", "line", "ship", "sail_date"] {
        assert!(empty.message.contains(field), "{}", empty.message);
    }
    assert_eq!(empty.external_id, None);
}

#[tokio::test]
async fn negative_nights_clamp_and_cheapest_price() {
    let env = test_env(1);
    let mut record = sailing("V-200", "SHIP-42", "2026-05-10", Some("649.00"));
    record["nights"] = json!("-3");
    record["cabins"] = json!([
        { "code": "4V", "category": "inside", "price": "649.00" },
        { "code": "6N", "category": "oceanview", "price": 599 },
        { "code": "XX", "category": "penthouse", "price": "99.00" },
        { "code": "1B", "category": "balcony" }
    ]);
    write_record(&env.feed_dir, "a.json", &record);
    let store = open_store(&env).await;

    let run = sync(&env, &store).await;
    assert_eq!(run.metrics.files_processed, 1);

    let s = store.get_sailing("V-200").await.unwrap().unwrap();
    assert_eq!(s.nights, 0);
    assert_eq!(s.end_date, s.sail_date);
    assert_eq!(s.prices.inside, Some(64_900));
    assert_eq!(s.prices.oceanview, Some(59_900));
    assert_eq!(s.prices.balcony, None);
    assert_eq!(s.cheapest_price, Some(59_900));
    assert_eq!(s.cabin_grades.len(), 3);
}

/// Cancels the run from inside the first fetch.
struct CancellingFeed {
    inner: DirectoryFeed,
    cancel: CancellationToken,
}

#[async_trait]
impl FeedSource for CancellingFeed {
    fn label(&self) -> String {
        self.inner.label()
    }

    async fn list_files(&self) -> Result<Vec<String>, FeedError> {
        self.inner.list_files().await
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        self.cancel.cancel();
        self.inner.fetch(path).await
    }
}

#[tokio::test]
async fn cancellation_leaves_remaining_files_unstarted() {
    let env = test_env(1);
    for (i, voyage) in ["V-1", "V-2", "V-3", "V-4"].iter().enumerate() {
        write_record(
            &env.feed_dir,
            &format!("{i}.json"),
            &sailing(voyage, "SHIP-42", "2026-04-01", None),
        );
    }
    let store = open_store(&env).await;
    let cancel = CancellationToken::new();
    let feed = CancellingFeed {
        inner: DirectoryFeed::new(env.feed_dir.clone(), &["**/*.json".to_string()], &[]).unwrap(),
        cancel: cancel.clone(),
    };
    let runner = SyncRunner::with_feed(
        Arc::clone(&store),
        Arc::new(feed),
        RunOptions {
            trigger: SyncTrigger::Cli,
            workers: 1,
            stale_after_minutes: 120,
        },
    );

    let run = runner.run(cancel, Arc::new(NoProgress)).await.unwrap();

    assert_eq!(run.status, SyncStatus::Cancelled);
    assert_eq!(run.metrics.files_processed, 1);
    assert_eq!(run.metrics.files_skipped, 0);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn second_run_is_refused_while_one_is_running() {
    let env = test_env(1);
    let store = open_store(&env).await;
    let held = SyncRun::start(SyncTrigger::Api, "directory:elsewhere", Utc::now().timestamp());
    assert!(store.start_run(&held).await.unwrap());

    let result = runner(&env, &store)
        .run(CancellationToken::new(), Arc::new(NoProgress))
        .await;
    assert!(matches!(result, Err(RunError::AlreadyRunning)));

    let runs = store.list_runs(10, 5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run.status, SyncStatus::Running);
}

#[tokio::test]
async fn stale_running_run_is_failed_before_a_new_one_starts() {
    let env = test_env(1);
    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", None));
    let store = open_store(&env).await;
    let three_hours_ago = Utc::now().timestamp() - 3 * 3600;
    let stale = SyncRun::start(SyncTrigger::Cli, "directory:old", three_hours_ago);
    assert!(store.start_run(&stale).await.unwrap());

    let run = sync(&env, &store).await;
    assert_eq!(run.status, SyncStatus::Completed);

    let old = store.get_run(&stale.id).await.unwrap().unwrap();
    assert_eq!(old.status, SyncStatus::Failed);
    assert_eq!(old.fatal_error.as_deref(), Some(ABANDONED_MESSAGE));
    assert!(old.completed_at.is_some());
}

#[tokio::test]
async fn missing_feed_root_fails_the_run() {
    let env = test_env(1);
    let config = env.config.clone().with_feed_root(env.tmp.path().join("nope"));
    let store = open_store(&env).await;
    let runner = SyncRunner::from_config(Arc::clone(&store), &config, SyncTrigger::Cli, None);

    let result = runner.run(CancellationToken::new(), Arc::new(NoProgress)).await;
    let Err(RunError::Fatal { run_id, message }) = result else {
        panic!("expected a fatal run error");
    };

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, SyncStatus::Failed);
    assert_eq!(run.fatal_error.as_deref(), Some(message.as_str()));
    assert_eq!(run.metrics.files_processed, 0);
}

#[tokio::test]
async fn search_reports_a_running_sync() {
    let env = test_env(1);
    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", None));
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let runner = runner(&env, &store);
    let run = runner.begin().await.unwrap();
    let during = search(&*store, &SearchRequest::default(), env.config.page_limits())
        .await
        .unwrap();
    assert!(during.sync_in_progress);
    assert_eq!(during.total, 1);

    runner
        .execute(&run.id, CancellationToken::new(), Arc::new(NoProgress))
        .await
        .unwrap();
    let after = search(&*store, &SearchRequest::default(), env.config.page_limits())
        .await
        .unwrap();
    assert!(!after.sync_in_progress);
}

#[tokio::test]
async fn price_sort_breaks_ties_by_id_and_drops_unpriced() {
    let env = test_env(2);
    write_record(&env.feed_dir, "a.json", &sailing("V-A", "SHIP-42", "2026-04-01", Some("649.00")));
    write_record(&env.feed_dir, "b.json", &sailing("V-B", "SHIP-42", "2026-04-08", Some("499.00")));
    write_record(&env.feed_dir, "c.json", &sailing("V-C", "SHIP-42", "2026-04-15", Some("499.00")));
    write_record(&env.feed_dir, "d.json", &sailing("V-D", "SHIP-42", "2026-04-22", None));
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let request = SearchRequest {
        filters: SearchFilters {
            cabin_category: Some(sailsync_core::models::CabinCategory::Inside),
            price_max_cents: Some(60_000),
            ..SearchFilters::default()
        },
        sort_by: SortField::Price,
        ..SearchRequest::default()
    };
    let page = search(&*store, &request, env.config.page_limits()).await.unwrap();

    assert_eq!(page.total, 2);
    let ids: Vec<&str> = page.items.iter().map(|s| s.id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert!(page
        .items
        .iter()
        .all(|s| s.external_id == "V-B" || s.external_id == "V-C"));

    let unfiltered = SearchRequest {
        sort_by: SortField::Price,
        ..SearchRequest::default()
    };
    let all = search(&*store, &unfiltered, env.config.page_limits()).await.unwrap();
    assert_eq!(all.total, 4);
    // cheapest over all categories: V-D only has its balcony price
    assert_eq!(all.items.last().unwrap().external_id, "V-D");
}

#[tokio::test]
async fn paging_reports_totals() {
    let env = test_env(2);
    for i in 0..5 {
        write_record(
            &env.feed_dir,
            &format!("{i}.json"),
            &sailing(&format!("V-{i}"), "SHIP-42", &format!("2026-06-0{}", i + 1), None),
        );
    }
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let request = SearchRequest {
        page: Some(3),
        page_size: Some(2),
        ..SearchRequest::default()
    };
    let page = search(&*store, &request, env.config.page_limits()).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert!(!page.has_more);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].external_id, "V-4");
}

#[tokio::test]
async fn notes_survive_a_resync() {
    let env = test_env(1);
    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", Some("649.00")));
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let sailing_row = store.get_sailing("V-1").await.unwrap().unwrap();
    store.set_notes(&sailing_row.id, "group block held").await.unwrap();

    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", Some("599.00")));
    sync(&env, &store).await;

    let after = store.get_sailing("V-1").await.unwrap().unwrap();
    assert_eq!(after.notes.as_deref(), Some("group block held"));
    assert_eq!(after.prices.inside, Some(59_900));
}

#[tokio::test]
async fn confirmed_entity_stays_confirmed_and_keeps_attributes() {
    let env = test_env(1);
    let mut record = sailing("V-1", "SHIP-42", "2026-04-01", None);
    record["ship"] = json!({ "id": "SHIP-42", "name": "Wonder of the Seas" });
    write_record(&env.feed_dir, "a.json", &record);
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let confirmed = store
        .confirm_entity(EntityKind::Ship, "SHIP-42", Utc::now().timestamp())
        .await
        .unwrap()
        .unwrap();
    assert!(!confirmed.is_stub);
    assert!(!confirmed.needs_review);

    // Bare id this time: stored name must not be erased.
    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", None));
    let run = sync(&env, &store).await;
    assert_eq!(run.metrics.stubs_created, 0);

    let ship = store
        .get_entity(EntityKind::Ship, "SHIP-42")
        .await
        .unwrap()
        .unwrap();
    assert!(!ship.is_stub);
    assert!(!ship.needs_review);
    assert_eq!(ship.name(), Some("Wonder of the Seas"));
    assert_eq!(ship.id, confirmed.id);

    assert!(store
        .confirm_entity(EntityKind::Ship, "SHIP-404", Utc::now().timestamp())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn coverage_flags_review_and_name_collisions() {
    let env = test_env(1);
    let mut a = sailing("V-1", "SHIP-42", "2026-04-01", None);
    a["ship"] = json!({ "id": "SHIP-42", "name": "wonder of the seas" });
    let mut b = sailing("V-2", "SHIP-7", "2026-04-08", None);
    b["ship"] = json!({ "id": "SHIP-7", "name": "Wonder of the Seas", "image_url": "https://img/7.jpg" });
    write_record(&env.feed_dir, "a.json", &a);
    write_record(&env.feed_dir, "b.json", &b);
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let stats = store.coverage(3, Utc::now().timestamp()).await.unwrap();
    assert_eq!(stats.kinds.len(), 4);
    // line + two ships + two ports + one region
    assert_eq!(stats.total_pending, 6);
    assert_eq!(stats.oldest_stubs.len(), 3);

    let ships = stats.kind(EntityKind::Ship).unwrap();
    assert_eq!(ships.total, 2);
    assert_eq!(ships.stubs, 2);
    assert_eq!(ships.needs_review, 2);
    assert_eq!(ships.with_key_media, 1);
    assert_eq!(ships.name_collisions.len(), 1);
    assert_eq!(ships.name_collisions[0].name, "Wonder of the Seas");
    assert_eq!(ships.name_collisions[0].external_ids, vec!["SHIP-42", "SHIP-7"]);

    store
        .confirm_entity(EntityKind::Ship, "SHIP-7", Utc::now().timestamp())
        .await
        .unwrap();
    let stats = store.coverage(3, Utc::now().timestamp()).await.unwrap();
    let ships = stats.kind(EntityKind::Ship).unwrap();
    assert_eq!(ships.stubs, 1);
    assert_eq!(ships.needs_review, 1);
    assert_eq!(stats.total_pending, 5);

    // Ports have names but no coordinates, so they still need review.
    let ports = stats.kind(EntityKind::Port).unwrap();
    assert_eq!(ports.needs_review, 2);
}

fn text_request(text: &str) -> SearchRequest {
    SearchRequest {
        filters: SearchFilters {
            text: Some(text.to_string()),
            ..SearchFilters::default()
        },
        ..SearchRequest::default()
    }
}

#[tokio::test]
async fn text_search_folds_non_ascii_case() {
    let env = test_env(1);
    let mut a = sailing("V-1", "SHIP-42", "2026-04-01", None);
    a["itinerary"] = json!([
        { "day": 1, "port": { "id": "NOU", "name": "Nouméa" } },
        { "day": 3, "port": { "id": "ILP", "name": "Île des Pins" } },
        { "day": 5, "port": { "id": "NOU", "name": "Nouméa" } }
    ]);
    let mut b = sailing("V-2", "SHIP-9", "2026-04-08", None);
    b["ship"] = json!({ "id": "SHIP-9", "name": "ÖLAND EXPLORER" });
    write_record(&env.feed_dir, "a.json", &a);
    write_record(&env.feed_dir, "b.json", &b);
    let store = open_store(&env).await;
    sync(&env, &store).await;

    for text in ["Île des", "île des", "ÎLE DES", "PINS", "nouméa", "NOUMÉA"] {
        let page = search(&*store, &text_request(text), env.config.page_limits())
            .await
            .unwrap();
        assert_eq!(page.total, 1, "{text}");
        assert_eq!(page.items[0].external_id, "V-1", "{text}");
    }
    let page = search(&*store, &text_request("öland"), env.config.page_limits())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].external_id, "V-2");
}

#[tokio::test]
async fn name_collisions_fold_non_ascii_case() {
    let env = test_env(1);
    let mut a = sailing("V-1", "SHIP-42", "2026-04-01", None);
    a["itinerary"] = json!([{ "day": 1, "port": { "id": "ILP", "name": "Île des Pins" } }]);
    let mut b = sailing("V-2", "SHIP-42", "2026-04-08", None);
    b["itinerary"] = json!([{ "day": 1, "port": { "id": "ILP2", "name": "ÎLE DES PINS" } }]);
    write_record(&env.feed_dir, "a.json", &a);
    write_record(&env.feed_dir, "b.json", &b);
    let store = open_store(&env).await;
    sync(&env, &store).await;

    let stats = store.coverage(10, Utc::now().timestamp()).await.unwrap();
    let ports = stats.kind(EntityKind::Port).unwrap();
    assert_eq!(ports.name_collisions.len(), 1);
    assert_eq!(ports.name_collisions[0].name, "ÎLE DES PINS");
    assert_eq!(ports.name_collisions[0].external_ids, vec!["ILP", "ILP2"]);
}

#[tokio::test]
async fn malformed_optional_containers_are_repaired_not_skipped() {
    let env = test_env(1);
    let mut a = sailing("V-1", "SHIP-42", "2026-04-01", Some("649.00"));
    a["itinerary"] = json!("n/a");
    a["regions"] = json!("Caribbean");
    a["prices"] = json!("tbd");
    let mut b = sailing("V-2", "SHIP-42", "2026-04-08", None);
    b["cabins"] = json!({});
    b["itinerary"] = json!([42, { "day": 1, "port": { "id": "MIA", "name": "Miami" } }]);
    write_record(&env.feed_dir, "a.json", &a);
    write_record(&env.feed_dir, "b.json", &b);
    let store = open_store(&env).await;

    let run = sync(&env, &store).await;

    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.metrics.files_processed, 2);
    assert_eq!(run.metrics.files_skipped, 0);
    assert!(run.errors.is_empty());

    let a = store.get_sailing("V-1").await.unwrap().unwrap();
    assert!(a.itinerary.is_empty());
    assert!(a.region_ids.is_empty());
    assert_eq!(a.prices.inside, Some(64_900));

    let b = store.get_sailing("V-2").await.unwrap().unwrap();
    assert!(b.cabin_grades.is_empty());
    assert_eq!(b.cheapest_price, None);
    assert_eq!(b.itinerary.len(), 1);
}

/// Parks the fetch of `b.json` until released, so the run stays open
/// after `a.json` has been upserted.
struct GatedFeed {
    inner: DirectoryFeed,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl FeedSource for GatedFeed {
    fn label(&self) -> String {
        self.inner.label()
    }

    async fn list_files(&self) -> Result<Vec<String>, FeedError> {
        self.inner.list_files().await
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        if path == "b.json" {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch(path).await
    }
}

#[tokio::test]
async fn search_runs_while_a_sync_is_upserting() {
    let env = test_env(1);
    write_record(&env.feed_dir, "a.json", &sailing("V-1", "SHIP-42", "2026-04-01", Some("649.00")));
    write_record(&env.feed_dir, "b.json", &sailing("V-2", "SHIP-42", "2026-04-08", Some("499.00")));
    let store = open_store(&env).await;
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let feed = GatedFeed {
        inner: DirectoryFeed::new(env.feed_dir.clone(), &["**/*.json".to_string()], &[]).unwrap(),
        reached: Arc::clone(&reached),
        release: Arc::clone(&release),
    };
    let runner = SyncRunner::with_feed(
        Arc::clone(&store),
        Arc::new(feed),
        RunOptions {
            trigger: SyncTrigger::Cli,
            workers: 1,
            stale_after_minutes: 120,
        },
    );

    let handle = tokio::spawn(async move {
        runner
            .run(CancellationToken::new(), Arc::new(NoProgress))
            .await
    });
    tokio::time::timeout(Duration::from_secs(10), reached.notified())
        .await
        .unwrap();

    let during = tokio::time::timeout(
        Duration::from_secs(5),
        search(&*store, &SearchRequest::default(), env.config.page_limits()),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(during.sync_in_progress);
    assert_eq!(during.total, 1);
    assert_eq!(during.items[0].external_id, "V-1");

    release.notify_one();
    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.metrics.files_processed, 2);

    let after = search(&*store, &SearchRequest::default(), env.config.page_limits())
        .await
        .unwrap();
    assert!(!after.sync_in_progress);
    assert_eq!(after.total, 2);
}
