//! Feed sources: where raw sailing files come from.
//!
//! | Source | Listing | Fetch |
//! |--------|---------|-------|
//! | [`DirectoryFeed`] | walk `root`, filter by include/exclude globs | read the file |
//! | [`HttpFeed`] | `GET {base_url}/{manifest}` (JSON list of paths) | `GET {base_url}/{path}` with basic auth |
//!
//! Listing failures and rejected credentials are fatal to a run. A single
//! file that cannot be fetched is a recoverable, per-file error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::{Config, FeedKind};
use crate::credentials::{CredentialError, CredentialSource, EnvCredentialSource, ProviderCredentials};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),
    #[error("feed provider rejected the credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("{0}")]
    File(String),
}

impl FeedError {
    /// Whether the error ends the whole run rather than one file.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FeedError::File(_))
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Short human label recorded on the run.
    fn label(&self) -> String;

    /// All file paths in the feed, sorted.
    async fn list_files(&self) -> Result<Vec<String>, FeedError>;

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FeedError>;
}

/// Builds the configured feed. Credentials are read here, once per run.
pub fn open_feed(
    config: &Config,
    credentials: Option<&dyn CredentialSource>,
) -> Result<Arc<dyn FeedSource>, FeedError> {
    match config.feed.kind {
        FeedKind::Directory => {
            let root = config
                .feed
                .root
                .clone()
                .ok_or_else(|| FeedError::Unavailable("feed.root is not set".to_string()))?;
            let feed = DirectoryFeed::new(root, &config.feed.include_globs, &config.feed.exclude_globs)?;
            Ok(Arc::new(feed))
        }
        FeedKind::Http => {
            let base_url = config
                .feed
                .base_url
                .clone()
                .ok_or_else(|| FeedError::Unavailable("feed.base_url is not set".to_string()))?;
            let creds = match credentials {
                Some(source) => source.credentials()?,
                None => EnvCredentialSource::from_config(&config.feed.credentials)?.credentials()?,
            };
            let feed = HttpFeed::new(
                base_url,
                config.feed.manifest.clone(),
                creds,
                Duration::from_secs(config.feed.timeout_secs),
            )?;
            Ok(Arc::new(feed))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Directory feed
// ═══════════════════════════════════════════════════════════════════════

pub struct DirectoryFeed {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl DirectoryFeed {
    pub fn new(
        root: PathBuf,
        include_globs: &[String],
        exclude_globs: &[String],
    ) -> Result<Self, FeedError> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            root,
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    fn full_path(&self, relative: &str) -> Result<PathBuf, FeedError> {
        let rel = Path::new(relative);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(FeedError::File(format!("path escapes the feed root: {relative}")));
        }
        Ok(self.root.join(rel))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, FeedError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| FeedError::Unavailable(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| FeedError::Unavailable(format!("invalid glob set: {e}")))
}

#[async_trait]
impl FeedSource for DirectoryFeed {
    fn label(&self) -> String {
        format!("directory:{}", self.root.display())
    }

    async fn list_files(&self) -> Result<Vec<String>, FeedError> {
        if !self.root.is_dir() {
            return Err(FeedError::Unavailable(format!(
                "feed root does not exist: {}",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| FeedError::Unavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }
            files.push(rel_str);
        }

        // Sort for deterministic ordering
        files.sort();
        Ok(files)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        let full = self.full_path(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| FeedError::File(format!("cannot read {}: {e}", full.display())))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP feed
// ═══════════════════════════════════════════════════════════════════════

pub struct HttpFeed {
    client: reqwest::Client,
    base_url: String,
    manifest: String,
    credentials: ProviderCredentials,
}

/// Manifest body: a bare list of paths or `{ "files": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<String>),
    Object { files: Vec<String> },
}

impl HttpFeed {
    pub fn new(
        base_url: String,
        manifest: String,
        credentials: ProviderCredentials,
        timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            manifest,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .get(self.url(path))
            .basic_auth(&self.credentials.username, Some(self.credentials.secret()))
            .send()
            .await
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl FeedSource for HttpFeed {
    fn label(&self) -> String {
        format!("http:{}", self.base_url)
    }

    async fn list_files(&self) -> Result<Vec<String>, FeedError> {
        let response = self
            .get(&self.manifest)
            .await
            .map_err(|e| FeedError::Unavailable(format!("manifest request failed: {e}")))?;
        let status = response.status();
        if is_auth_failure(status) {
            return Err(FeedError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FeedError::Unavailable(format!(
                "manifest request returned HTTP {}",
                status.as_u16()
            )));
        }
        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| FeedError::Unavailable(format!("manifest is not a list of paths: {e}")))?;
        let mut files = match manifest {
            Manifest::List(files) | Manifest::Object { files } => files,
        };
        files.sort();
        files.dedup();
        Ok(files)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FeedError> {
        let response = self
            .get(path)
            .await
            .map_err(|e| FeedError::File(format!("request for {path} failed: {e}")))?;
        let status = response.status();
        if is_auth_failure(status) {
            return Err(FeedError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FeedError::File(format!(
                "request for {path} returned HTTP {}",
                status.as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| FeedError::File(format!("reading {path} failed: {e}")))?;
        Ok(body.to_vec())
    }
}
