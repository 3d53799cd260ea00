//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/sailsync.sqlite"
//! max_connections = 5
//!
//! [feed]
//! kind = "directory"            # or "http"
//! root = "./feed"
//! include_globs = ["**/*.json"]
//!
//! [sync]
//! workers = 4
//! stale_after_minutes = 120
//!
//! [search]
//! default_page_size = 20
//! max_page_size = 100
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```
//!
//! Every section except `[db]` and `[feed]` is optional.

use anyhow::{Context, Result};
use sailsync_core::search::PageLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    #[default]
    Directory,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default)]
    pub kind: FeedKind,
    /// Directory feeds: root folder of the JSON files.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// HTTP feeds: provider base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// HTTP feeds: manifest path relative to `base_url`.
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}
fn default_manifest() -> String {
    "manifest.json".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

/// Names of the environment variables holding provider credentials.
/// The values themselves never appear in config files.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    pub username_env: Option<String>,
    pub secret_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: i64,
    #[serde(default = "default_error_preview")]
    pub error_preview: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stale_after_minutes: default_stale_after_minutes(),
            error_preview: default_error_preview(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_stale_after_minutes() -> i64 {
    120
}
fn default_error_preview() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_page_size() -> u32 {
    20
}
fn default_max_page_size() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default = "default_oldest_stubs")]
    pub oldest_stubs: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            oldest_stubs: default_oldest_stubs(),
        }
    }
}

fn default_oldest_stubs() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.search.default_page_size,
            max_page_size: self.search.max_page_size,
        }
    }

    /// Points the feed at a local directory, as `sync --feed DIR` does.
    pub fn with_feed_root(mut self, root: PathBuf) -> Self {
        self.feed.kind = FeedKind::Directory;
        self.feed.root = Some(root);
        self
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Validate db
    if config.db.max_connections < 2 {
        anyhow::bail!("db.max_connections must be >= 2");
    }

    // Validate sync
    if config.sync.workers == 0 {
        anyhow::bail!("sync.workers must be >= 1");
    }
    if config.sync.workers as u32 >= config.db.max_connections {
        anyhow::bail!(
            "sync.workers ({}) must be less than db.max_connections ({}) so search keeps a connection",
            config.sync.workers,
            config.db.max_connections
        );
    }
    if config.sync.stale_after_minutes < 1 {
        anyhow::bail!("sync.stale_after_minutes must be >= 1");
    }

    // Validate search
    if config.search.default_page_size == 0 || config.search.max_page_size == 0 {
        anyhow::bail!("search page sizes must be >= 1");
    }
    if config.search.default_page_size > config.search.max_page_size {
        anyhow::bail!(
            "search.default_page_size ({}) must not exceed search.max_page_size ({})",
            config.search.default_page_size,
            config.search.max_page_size
        );
    }

    // Validate feed
    match config.feed.kind {
        FeedKind::Directory => {
            if config.feed.root.is_none() {
                anyhow::bail!("feed.root is required when feed.kind = \"directory\"");
            }
        }
        FeedKind::Http => {
            match config.feed.base_url.as_deref() {
                None | Some("") => {
                    anyhow::bail!("feed.base_url is required when feed.kind = \"http\"")
                }
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    anyhow::bail!("feed.base_url must be an http(s) URL, got '{}'", url)
                }
                Some(_) => {}
            }
            let creds = &config.feed.credentials;
            if creds.username_env.is_none() || creds.secret_env.is_none() {
                anyhow::bail!(
                    "feed.credentials.username_env and feed.credentials.secret_env are required for http feeds"
                );
            }
        }
    }
    if config.feed.timeout_secs == 0 {
        anyhow::bail!("feed.timeout_secs must be >= 1");
    }

    Ok(())
}
