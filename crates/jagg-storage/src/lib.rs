//! Outbound HTTP fetch utilities and the posting store for jagg.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jagg_core::{JobPosting, Platform};
use reqwest::{header, redirect};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "jagg-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> FailureDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureDisposition::Transient
    } else {
        FailureDisposition::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FailureDisposition::Transient
    } else {
        FailureDisposition::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            probe_timeout: Duration::from_secs(6),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

/// Shared outbound client. Every call is a single attempt; callers decide
/// what a failure means.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }

    pub fn disposition(&self) -> FailureDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureDisposition::Permanent),
            FetchError::Closed => FailureDisposition::Transient,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        // Probes must see 301/302 themselves.
        let mut probe_builder = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.probe_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
            probe_builder = probe_builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let probe_client = probe_builder
            .build()
            .context("building reqwest probe client")?;

        Ok(Self {
            client,
            probe_client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// GET `url`; any non-success status is returned as [`FetchError::HttpStatus`].
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_label: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source = source_label, url);
        async move {
            let resp = self
                .client
                .get(url)
                .header(header::ACCEPT, "application/json")
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// HEAD `url` without following redirects and return the raw status.
    pub async fn probe(&self, run_id: Uuid, url: &str) -> Result<StatusCode, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_probe", %run_id, url);
        async move {
            let status = self.probe_client.head(url).send().await?.status();
            debug!(status = status.as_u16(), "probed");
            Ok(status)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("posting has no url and cannot be stored")]
    MissingUrl,
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing store snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("parsing store snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Only ever non-zero for [`PostingStore::replace_all`].
    pub removed: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Read-path filter. String filters are case-insensitive substring matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PostingQuery {
    pub source: Option<Platform>,
    /// Matches title or organization key.
    pub q: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl PostingQuery {
    fn matches(&self, posting: &JobPosting) -> bool {
        if self.source.is_some_and(|s| s != posting.source) {
            return false;
        }
        if self.remote.is_some_and(|r| r != posting.remote) {
            return false;
        }
        if let Some(q) = needle(&self.q) {
            if !contains_ci(&posting.title, &q) && !contains_ci(&posting.organization_key, &q) {
                return false;
            }
        }
        if let Some(company) = needle(&self.company) {
            if !contains_ci(&posting.organization_key, &company) {
                return false;
            }
        }
        if let Some(location) = needle(&self.location) {
            if !contains_ci(&posting.location, &location) {
                return false;
            }
        }
        true
    }
}

fn needle(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

fn contains_ci(haystack: &str, lowered_needle: &str) -> bool {
    haystack.to_lowercase().contains(lowered_needle)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostingPage {
    pub total_matches: usize,
    pub postings: Vec<JobPosting>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    posting: JobPosting,
    seq: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<String, StoredRecord>,
    next_seq: u64,
}

impl StoreState {
    fn upsert(&mut self, incoming: JobPosting) -> UpsertOutcome {
        if let Some(existing) = self.records.get_mut(&incoming.url) {
            return if existing.posting.merge_from(&incoming) {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            };
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            incoming.url.clone(),
            StoredRecord {
                posting: incoming,
                seq,
            },
        );
        UpsertOutcome::Inserted
    }

    /// `ts` descending, ties by first insertion order.
    fn ordered(&self) -> Vec<&StoredRecord> {
        let mut rows = self.records.values().collect::<Vec<_>>();
        rows.sort_by_key(|r| (Reverse(r.posting.ts), r.seq));
        rows
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    postings: Vec<JobPosting>,
}

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Holds the current posting set, at most one record per url.
///
/// Every write takes the lock once for its whole batch, so readers see either
/// the state before a merge or after it.
#[derive(Debug, Default)]
pub struct PostingStore {
    state: RwLock<StoreState>,
}

impl PostingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the whole visible set. Duplicate urls in the input are merged.
    /// Stats compare the new set against the one it replaces.
    pub async fn replace_all(&self, postings: Vec<JobPosting>) -> Result<MergeStats, StoreError> {
        self.replace_all_keeping(postings, |_| false).await
    }

    /// Like [`Self::replace_all`], but stored records matching `keep` that
    /// the new set does not mention are carried over unchanged.
    ///
    /// A url already stored keeps its insertion seq, and keeps its `ts` when
    /// the incoming copy carries no timestamps.
    pub async fn replace_all_keeping<F>(
        &self,
        postings: Vec<JobPosting>,
        keep: F,
    ) -> Result<MergeStats, StoreError>
    where
        F: Fn(&JobPosting) -> bool,
    {
        ensure_urls(&postings)?;
        let mut state = self.state.write().await;
        let mut next = StoreState {
            records: HashMap::with_capacity(postings.len()),
            next_seq: state.next_seq,
        };
        for mut posting in postings {
            match state.records.get(&posting.url) {
                Some(prev) if !next.records.contains_key(&posting.url) => {
                    if posting.created_at <= 0 && posting.updated_at <= 0 {
                        posting.ts = prev.posting.ts;
                    }
                    next.records.insert(
                        posting.url.clone(),
                        StoredRecord {
                            posting,
                            seq: prev.seq,
                        },
                    );
                }
                _ => {
                    next.upsert(posting);
                }
            }
        }

        let mut stats = MergeStats::default();
        for record in next.records.values() {
            stats.record(match state.records.get(&record.posting.url) {
                None => UpsertOutcome::Inserted,
                Some(prev) if prev.posting == record.posting => UpsertOutcome::Unchanged,
                Some(_) => UpsertOutcome::Updated,
            });
        }
        for (url, record) in &state.records {
            if !next.records.contains_key(url) && keep(&record.posting) {
                next.records.insert(url.clone(), record.clone());
            }
        }
        stats.removed = state
            .records
            .keys()
            .filter(|url| !next.records.contains_key(*url))
            .count();
        *state = next;
        Ok(stats)
    }

    pub async fn upsert(&self, posting: JobPosting) -> Result<UpsertOutcome, StoreError> {
        ensure_urls(std::slice::from_ref(&posting))?;
        Ok(self.state.write().await.upsert(posting))
    }

    /// Upsert a batch under one write lock. Nothing is applied if any posting
    /// lacks a url.
    pub async fn merge_batch(&self, postings: Vec<JobPosting>) -> Result<MergeStats, StoreError> {
        ensure_urls(&postings)?;
        let mut state = self.state.write().await;
        let mut stats = MergeStats::default();
        for posting in postings {
            stats.record(state.upsert(posting));
        }
        Ok(stats)
    }

    pub async fn list(&self, query: &PostingQuery) -> PostingPage {
        let state = self.state.read().await;
        let matching = state
            .ordered()
            .into_iter()
            .filter(|r| query.matches(&r.posting))
            .collect::<Vec<_>>();
        let total_matches = matching.len();
        let postings = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|r| r.posting.clone())
            .collect();
        PostingPage {
            total_matches,
            postings,
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<JobPosting> {
        self.state
            .read()
            .await
            .records
            .values()
            .find(|r| r.posting.id() == id)
            .map(|r| r.posting.clone())
    }

    pub async fn get_by_url(&self, url: &str) -> Option<JobPosting> {
        self.state
            .read()
            .await
            .records
            .get(url)
            .map(|r| r.posting.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// SHA-256 over the ordered contents.
    pub async fn digest(&self) -> Result<String, StoreError> {
        let state = self.state.read().await;
        let ordered = state
            .ordered()
            .into_iter()
            .map(|r| &r.posting)
            .collect::<Vec<_>>();
        let bytes = serde_json::to_vec(&ordered)?;
        Ok(sha256_hex(&bytes))
    }

    /// Write the ordered contents to `path` via a temp file and atomic rename.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref();
        let snapshot = {
            let state = self.state.read().await;
            StoreSnapshot {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                saved_at: Utc::now(),
                postings: state
                    .ordered()
                    .into_iter()
                    .map(|r| r.posting.clone())
                    .collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(io_error("creating snapshot directory", &parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error("opening temp snapshot", &temp_path))?;
        file.write_all(&bytes)
            .await
            .map_err(io_error("writing temp snapshot", &temp_path))?;
        file.flush()
            .await
            .map_err(io_error("flushing temp snapshot", &temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                action: "renaming temp snapshot into",
                path: path.to_path_buf(),
                source: err,
            });
        }
        debug!(path = %path.display(), postings = snapshot.postings.len(), "snapshot saved");
        Ok(snapshot.postings.len())
    }

    /// Build a store from a snapshot file. A missing file yields an empty store.
    pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::new();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(err) => return Err(io_error("reading snapshot", path)(err)),
        };
        let snapshot: StoreSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let postings = snapshot
            .postings
            .into_iter()
            .filter(|p| !p.url.trim().is_empty())
            .collect::<Vec<_>>();
        store.replace_all(postings).await?;
        Ok(store)
    }
}

fn ensure_urls(postings: &[JobPosting]) -> Result<(), StoreError> {
    if postings.iter().any(|p| p.url.trim().is_empty()) {
        return Err(StoreError::MissingUrl);
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
