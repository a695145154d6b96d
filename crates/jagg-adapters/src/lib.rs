//! Platform adapter contracts, the Lever and Greenhouse adapters, and
//! platform detection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jagg_core::{normalize_timestamp, JobPosting, Platform, PostingDraft};
use jagg_storage::{FailureDisposition, FetchError, FetchedResponse, HttpFetcher, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jagg-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Wall clock of the refresh; `ts` fallback for timestamp-less postings.
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected listing shape: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection failure, 5xx or 429.
    Transient,
    /// Any other non-success status.
    Rejected,
    /// Body could not be mapped at the top level.
    Malformed,
    /// The source task itself faulted or overran its guard.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl SourceFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedListing {
    pub postings: Vec<JobPosting>,
    /// Upstream items skipped because they were not objects or had no url.
    pub dropped_items: usize,
}

/// Result of one adapter call. Never an `Err`: the caller gets a typed
/// reason instead of a silently empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Fetched(ParsedListing),
    /// The organization is not on this platform (404).
    Unavailable,
    Failed(SourceFailure),
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Listing endpoint for one organization.
    fn listing_url(&self, organization_key: &str) -> String;

    /// Public board page used as the existence probe target.
    fn board_url(&self, organization_key: &str) -> String;

    fn parse_listing(
        &self,
        organization_key: &str,
        body: &[u8],
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError>;

    /// One outbound GET, no retries.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        organization_key: &str,
    ) -> SourceOutcome {
        let url = self.listing_url(organization_key);
        let label = format!("{}:{}", self.platform(), organization_key);
        let response = http.fetch_bytes(ctx.run_id, &label, &url).await;
        outcome_from_response(self, organization_key, ctx, response)
    }

    /// Whether this platform hosts the organization. Probe failures count as no.
    async fn probe(&self, http: &HttpFetcher, ctx: &AdapterContext, organization_key: &str) -> bool {
        match http.probe(ctx.run_id, &self.board_url(organization_key)).await {
            Ok(status) => hosts_organization(status),
            Err(err) => {
                debug!(platform = %self.platform(), organization_key, error = %err, "probe failed");
                false
            }
        }
    }
}

pub fn hosts_organization(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 301 | 302)
}

/// Map a transport result onto a [`SourceOutcome`] using `adapter`'s parser.
pub fn outcome_from_response<A: PlatformAdapter + ?Sized>(
    adapter: &A,
    organization_key: &str,
    ctx: &AdapterContext,
    response: Result<FetchedResponse, FetchError>,
) -> SourceOutcome {
    let platform = adapter.platform();
    match response {
        Ok(resp) => match adapter.parse_listing(organization_key, &resp.body, ctx) {
            Ok(listing) => {
                debug!(
                    %platform,
                    organization_key,
                    status = resp.status.as_u16(),
                    url = %resp.final_url,
                    postings = listing.postings.len(),
                    "listing parsed"
                );
                if listing.dropped_items > 0 {
                    debug!(
                        %platform,
                        organization_key,
                        dropped = listing.dropped_items,
                        "dropped unusable listing items"
                    );
                }
                SourceOutcome::Fetched(listing)
            }
            Err(err) => {
                warn!(
                    %platform,
                    organization_key,
                    url = %resp.final_url,
                    error = %err,
                    "malformed listing body"
                );
                SourceOutcome::Failed(SourceFailure::new(FailureKind::Malformed, err.to_string()))
            }
        },
        Err(err) if err.is_not_found() => SourceOutcome::Unavailable,
        Err(err) => {
            let kind = match err.disposition() {
                FailureDisposition::Transient => FailureKind::Transient,
                FailureDisposition::Permanent => FailureKind::Rejected,
            };
            warn!(%platform, organization_key, error = %err, "source fetch failed");
            SourceOutcome::Failed(SourceFailure::new(kind, err.to_string()))
        }
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn collect_postings<'a>(
    platform: Platform,
    organization_key: &str,
    ctx: &AdapterContext,
    items: impl Iterator<Item = &'a JsonValue>,
    to_draft: fn(&JsonValue) -> PostingDraft,
) -> ParsedListing {
    let mut listing = ParsedListing::default();
    for item in items {
        let posting = item
            .is_object()
            .then(|| to_draft(item))
            .and_then(|draft| draft.into_posting(platform, organization_key, ctx.fetched_at));
        match posting {
            Some(posting) => listing.postings.push(posting),
            None => listing.dropped_items += 1,
        }
    }
    listing
}

#[derive(Debug, Clone)]
pub struct LeverAdapter {
    api_base: String,
    board_base: String,
}

impl Default for LeverAdapter {
    fn default() -> Self {
        Self::with_bases("https://api.lever.co", "https://jobs.lever.co")
    }
}

impl LeverAdapter {
    pub fn with_bases(api_base: impl Into<String>, board_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            board_base: board_base.into().trim_end_matches('/').to_string(),
        }
    }
}

fn lever_draft(item: &JsonValue) -> PostingDraft {
    PostingDraft {
        title: json_text(item, &["text"]),
        location: json_text(item, &["categories", "location"]),
        url: json_text(item, &["hostedUrl"]),
        workplace_hint: json_text(item, &["workplaceType"]),
        created_at: normalize_timestamp(item.get("createdAt")),
        updated_at: normalize_timestamp(item.get("updatedAt")),
    }
}

#[async_trait]
impl PlatformAdapter for LeverAdapter {
    fn platform(&self) -> Platform {
        Platform::Lever
    }

    fn listing_url(&self, organization_key: &str) -> String {
        format!("{}/v0/postings/{}?mode=json", self.api_base, organization_key.trim())
    }

    fn board_url(&self, organization_key: &str) -> String {
        format!("{}/{}", self.board_base, organization_key.trim())
    }

    fn parse_listing(
        &self,
        organization_key: &str,
        body: &[u8],
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError> {
        let items = match serde_json::from_slice::<JsonValue>(body)? {
            JsonValue::Null => return Ok(ParsedListing::default()),
            JsonValue::Array(items) => items,
            other => {
                return Err(AdapterError::Shape(format!(
                    "expected an array of postings, found {}",
                    json_kind(&other)
                )))
            }
        };
        Ok(collect_postings(
            Platform::Lever,
            organization_key,
            ctx,
            items.iter(),
            lever_draft,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    api_base: String,
    board_base: String,
}

impl Default for GreenhouseAdapter {
    fn default() -> Self {
        Self::with_bases(
            "https://boards-api.greenhouse.io",
            "https://boards.greenhouse.io",
        )
    }
}

impl GreenhouseAdapter {
    pub fn with_bases(api_base: impl Into<String>, board_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            board_base: board_base.into().trim_end_matches('/').to_string(),
        }
    }
}

fn greenhouse_draft(item: &JsonValue) -> PostingDraft {
    // Explicit location object first, then the first office.
    let location = json_text(item, &["location", "name"]).or_else(|| {
        item.get("offices")
            .and_then(JsonValue::as_array)
            .and_then(|offices| offices.first())
            .and_then(|office| json_text(office, &["name"]))
    });
    PostingDraft {
        title: json_text(item, &["title"]),
        location,
        url: json_text(item, &["absolute_url"]),
        workplace_hint: None,
        created_at: normalize_timestamp(item.get("created_at")),
        updated_at: normalize_timestamp(item.get("updated_at")),
    }
}

#[async_trait]
impl PlatformAdapter for GreenhouseAdapter {
    fn platform(&self) -> Platform {
        Platform::Greenhouse
    }

    fn listing_url(&self, organization_key: &str) -> String {
        format!(
            "{}/v1/boards/{}/jobs?content=true",
            self.api_base,
            organization_key.trim()
        )
    }

    fn board_url(&self, organization_key: &str) -> String {
        format!("{}/{}", self.board_base, organization_key.trim())
    }

    fn parse_listing(
        &self,
        organization_key: &str,
        body: &[u8],
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError> {
        let jobs = match serde_json::from_slice::<JsonValue>(body)? {
            JsonValue::Null => return Ok(ParsedListing::default()),
            JsonValue::Object(mut payload) => match payload.remove("jobs") {
                None | Some(JsonValue::Null) => return Ok(ParsedListing::default()),
                Some(JsonValue::Array(jobs)) => jobs,
                Some(other) => {
                    return Err(AdapterError::Shape(format!(
                        "`jobs` is {}, expected an array",
                        json_kind(&other)
                    )))
                }
            },
            other => {
                return Err(AdapterError::Shape(format!(
                    "expected an object with a `jobs` array, found {}",
                    json_kind(&other)
                )))
            }
        };
        Ok(collect_postings(
            Platform::Greenhouse,
            organization_key,
            ctx,
            jobs.iter(),
            greenhouse_draft,
        ))
    }
}

pub fn adapter_for_platform(platform: Platform) -> Arc<dyn PlatformAdapter> {
    match platform {
        Platform::Lever => Arc::new(LeverAdapter::default()),
        Platform::Greenhouse => Arc::new(GreenhouseAdapter::default()),
    }
}

/// Adapters in detection priority order, at most one per platform.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn PlatformAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|a| a.platform()))
            .finish()
    }
}

impl AdapterRegistry {
    pub fn builtin() -> Self {
        Platform::ALL
            .into_iter()
            .fold(Self::default(), |registry, platform| {
                registry.with_adapter(adapter_for_platform(platform))
            })
    }

    /// Register `adapter`, replacing any adapter for the same platform in place.
    pub fn with_adapter(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        let platform = adapter.platform();
        match self.adapters.iter().position(|a| a.platform() == platform) {
            Some(idx) => self.adapters[idx] = adapter,
            None => self.adapters.push(adapter),
        }
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.platform() == platform)
            .cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.iter().map(|a| a.platform()).collect()
    }

    /// Probe each platform in priority order and stop at the first that
    /// hosts `organization_key`. `None` means skip, not error.
    pub async fn detect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        organization_key: &str,
    ) -> Option<Platform> {
        for adapter in &self.adapters {
            if adapter.probe(http, ctx, organization_key).await {
                return Some(adapter.platform());
            }
        }
        None
    }
}

/// Serves listing payloads from `<root>/<platform>/<organization_key>.json`
/// through a real adapter's parser instead of the network. A missing file
/// behaves like a 404.
pub struct FixtureAdapter {
    inner: Arc<dyn PlatformAdapter>,
    root: PathBuf,
}

impl FixtureAdapter {
    pub fn new(inner: Arc<dyn PlatformAdapter>, root: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            root: root.into(),
        }
    }

    pub fn payload_path(&self, organization_key: &str) -> PathBuf {
        self.root
            .join(self.inner.platform().as_str())
            .join(format!("{}.json", organization_key.trim()))
    }
}

/// Builtin adapters, each reading from fixtures under `root`.
pub fn fixture_registry(root: impl AsRef<Path>) -> AdapterRegistry {
    let root = root.as_ref();
    Platform::ALL
        .into_iter()
        .fold(AdapterRegistry::default(), |registry, platform| {
            registry.with_adapter(Arc::new(FixtureAdapter::new(
                adapter_for_platform(platform),
                root,
            )))
        })
}

#[async_trait]
impl PlatformAdapter for FixtureAdapter {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    fn listing_url(&self, organization_key: &str) -> String {
        self.payload_path(organization_key).display().to_string()
    }

    fn board_url(&self, organization_key: &str) -> String {
        self.listing_url(organization_key)
    }

    fn parse_listing(
        &self,
        organization_key: &str,
        body: &[u8],
        ctx: &AdapterContext,
    ) -> Result<ParsedListing, AdapterError> {
        self.inner.parse_listing(organization_key, body, ctx)
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        organization_key: &str,
    ) -> SourceOutcome {
        let path = self.payload_path(organization_key);
        let response = match fs::read(&path).await {
            Ok(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: path.display().to_string(),
                body,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(FetchError::HttpStatus {
                status: 404,
                url: path.display().to_string(),
            }),
            Err(err) => {
                return SourceOutcome::Failed(SourceFailure::new(
                    FailureKind::Transient,
                    format!("reading {}: {err}", path.display()),
                ))
            }
        };
        outcome_from_response(self, organization_key, ctx, response)
    }

    async fn probe(&self, _http: &HttpFetcher, _ctx: &AdapterContext, organization_key: &str) -> bool {
        fs::metadata(self.payload_path(organization_key))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}
