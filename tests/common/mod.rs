//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use sailsync::config::{parse_config, Config};
use sailsync::sqlite_store::SqliteStore;

pub struct TestEnv {
    pub tmp: TempDir,
    pub feed_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: Config,
}

/// A temp workspace with a config, an empty feed directory, and a data dir.
pub fn test_env(workers: usize) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let feed_dir = root.join("feed");
    fs::create_dir_all(&feed_dir).unwrap();
    fs::create_dir_all(root.join("config")).unwrap();

    let content = format!(
        r#"[db]
path = "{root}/data/sailsync.sqlite"
max_connections = {max_connections}

[feed]
kind = "directory"
root = "{root}/feed"

[sync]
workers = {workers}

[server]
bind = "127.0.0.1:7349"
"#,
        root = root.display(),
        max_connections = workers + 2,
        workers = workers,
    );
    let config_path = root.join("config").join("sailsync.toml");
    fs::write(&config_path, &content).unwrap();
    let config = parse_config(&content).unwrap();

    TestEnv {
        tmp,
        feed_dir,
        config_path,
        config,
    }
}

pub async fn open_store(env: &TestEnv) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(&env.config).await.unwrap())
}

/// A complete, valid sailing record.
pub fn sailing(voyage: &str, ship: &str, sail_date: &str, inside: Option<&str>) -> Value {
    json!({
        "voyage_id": voyage,
        "name": format!("Caribbean Escape {voyage}"),
        "line": { "id": "RCL", "name": "Royal Caribbean" },
        "ship": ship,
        "sail_date": sail_date,
        "nights": 7,
        "regions": [{ "id": "CARIB", "name": "Caribbean" }],
        "itinerary": [
            { "day": 1, "port": { "id": "MIA", "name": "Miami" }, "departure": "16:00" },
            { "day": 4, "port": { "id": "CZM", "name": "Cozumel" }, "arrival": "08:00", "departure": "17:00" },
            { "day": 8, "port": { "id": "MIA", "name": "Miami" }, "arrival": "06:00" }
        ],
        "cabins": [
            { "code": "4V", "name": "Interior", "category": "inside", "price": inside },
            { "code": "1B", "name": "Balcony", "category": "balcony", "price": "1099.00" }
        ],
        "currency": "usd"
    })
}

pub fn write_record(dir: &Path, name: &str, record: &Value) {
    fs::write(dir.join(name), serde_json::to_vec_pretty(record).unwrap()).unwrap();
}

pub fn write_raw(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}
