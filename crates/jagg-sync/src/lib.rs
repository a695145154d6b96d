//! Refresh orchestration: fan out one adapter call per configured source,
//! fan the outcomes back in, merge them into the posting store.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use jagg_adapters::{
    fixture_registry, AdapterContext, AdapterRegistry, FailureKind, SourceFailure, SourceOutcome,
};
use jagg_core::{JobPosting, Platform};
use jagg_storage::{HttpClientConfig, HttpFetcher, MergeStats, PostingStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jagg-sync";

/// Which platform a configured source lives on. `auto` defers to detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PlatformSelector {
    Fixed(Platform),
    Auto,
}

impl PlatformSelector {
    pub fn fixed(&self) -> Option<Platform> {
        match self {
            PlatformSelector::Fixed(platform) => Some(*platform),
            PlatformSelector::Auto => None,
        }
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformSelector::Fixed(platform) => platform.fmt(f),
            PlatformSelector::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for PlatformSelector {
    type Err = jagg_core::UnknownPlatform;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(PlatformSelector::Auto);
        }
        s.parse().map(PlatformSelector::Fixed)
    }
}

impl TryFrom<String> for PlatformSelector {
    type Error = jagg_core::UnknownPlatform;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlatformSelector> for String {
    fn from(value: PlatformSelector) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub platform: PlatformSelector,
    pub organization_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn new(platform: PlatformSelector, organization_key: impl Into<String>) -> Self {
        Self {
            platform,
            organization_key: organization_key.into(),
            enabled: true,
            notes: None,
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled entries in declaration order, keys trimmed, blank keys and
    /// repeated (platform, key) pairs dropped.
    pub fn enabled_sources(&self) -> Vec<SourceConfig> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| {
                let key = s.organization_key.trim();
                if key.is_empty() || !seen.insert((s.platform, key.to_string())) {
                    return None;
                }
                Some(SourceConfig {
                    organization_key: key.to_string(),
                    ..s.clone()
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Reconcile each posting by url; nothing is ever removed.
    #[default]
    Upsert,
    /// Swap the whole set, but only when at least one source was fetched.
    Replace,
}

impl FromStr for StoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(StoreMode::Upsert),
            "replace" | "replace_all" => Ok(StoreMode::Replace),
            other => anyhow::bail!("unknown store mode `{other}` (expected upsert or replace)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub max_concurrency: usize,
    pub store_mode: StoreMode,
    pub snapshot_path: Option<PathBuf>,
    pub fixtures_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("./sources.yaml"),
            user_agent: "jagg-bot/0.1 (+jobs-fetcher)".to_string(),
            http_timeout_secs: 12,
            probe_timeout_secs: 6,
            source_timeout_secs: 15,
            max_concurrency: 16,
            store_mode: StoreMode::Upsert,
            snapshot_path: None,
            fixtures_dir: None,
            scheduler_enabled: false,
            refresh_cron: "0 */30 * * * *".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl RefreshConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let store_mode = match std::env::var("JAGG_STORE_MODE") {
            Ok(v) => v.parse().context("reading JAGG_STORE_MODE")?,
            Err(_) => defaults.store_mode,
        };
        Ok(Self {
            sources_file: env_path("JAGG_SOURCES_FILE").unwrap_or(defaults.sources_file),
            user_agent: std::env::var("JAGG_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JAGG_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            probe_timeout_secs: env_parse("JAGG_PROBE_TIMEOUT_SECS")
                .unwrap_or(defaults.probe_timeout_secs),
            source_timeout_secs: env_parse("JAGG_SOURCE_TIMEOUT_SECS")
                .unwrap_or(defaults.source_timeout_secs),
            max_concurrency: env_parse("JAGG_MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            store_mode,
            snapshot_path: env_path("JAGG_SNAPSHOT_PATH"),
            fixtures_dir: env_path("JAGG_FIXTURES_DIR"),
            scheduler_enabled: std::env::var("JAGG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("JAGG_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.max_concurrency,
        }
    }

    pub fn adapter_registry(&self) -> AdapterRegistry {
        match &self.fixtures_dir {
            Some(dir) => fixture_registry(dir),
            None => AdapterRegistry::builtin(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Fetched,
    Unavailable,
    Failed,
    /// Detection found no platform hosting the organization.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub requested: PlatformSelector,
    /// Resolved platform; `None` when detection found nothing or did not finish.
    pub platform: Option<Platform>,
    pub organization_key: String,
    pub status: SourceStatus,
    pub postings: usize,
    pub dropped_items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SourceFailure>,
}

/// Posting counts of one pass after cross-source dedup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshCounts {
    pub total: usize,
    #[serde(flatten)]
    pub per_platform: BTreeMap<Platform, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_mode: StoreMode,
    pub counts: RefreshCounts,
    pub changes: MergeStats,
    pub sources: Vec<SourceReport>,
    pub store_total: usize,
    pub store_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    /// This pass's merged postings, `ts` descending with ties in declared
    /// source order. Not serialized; the read API serves the stored view.
    #[serde(skip_serializing)]
    pub postings: Vec<JobPosting>,
}

impl RefreshSummary {
    pub fn sources_with(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }
}

/// The only failures a refresh reports. Upstream problems never end up here.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("merging refreshed postings into the store: {0}")]
    Merge(#[source] StoreError),
    #[error("digesting store contents: {0}")]
    Digest(#[source] StoreError),
    #[error("persisting store snapshot: {0}")]
    Snapshot(#[source] StoreError),
}

enum SourceRun {
    Skipped,
    Ran {
        platform: Platform,
        outcome: SourceOutcome,
    },
    /// Detection or fetch overran the guard, or the task panicked.
    Aborted {
        platform: Option<Platform>,
        failure: SourceFailure,
    },
}

pub struct RefreshOrchestrator {
    http: Arc<HttpFetcher>,
    adapters: AdapterRegistry,
    store: Arc<PostingStore>,
    mode: StoreMode,
    source_timeout: Duration,
    /// Bounds in-flight source tasks; the timeout guard starts once a task
    /// holds a permit.
    source_limit: Arc<Semaphore>,
    snapshot_path: Option<PathBuf>,
    gate: Mutex<()>,
}

impl RefreshOrchestrator {
    pub fn new(http: Arc<HttpFetcher>, adapters: AdapterRegistry, store: Arc<PostingStore>) -> Self {
        Self {
            http,
            adapters,
            store,
            mode: StoreMode::Upsert,
            source_timeout: Duration::from_secs(15),
            source_limit: Arc::new(Semaphore::new(16)),
            snapshot_path: None,
            gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &RefreshConfig, store: Arc<PostingStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(Arc::new(http), config.adapter_registry(), store)
            .with_mode(config.store_mode)
            .with_source_timeout(Duration::from_secs(config.source_timeout_secs))
            .with_max_concurrency(config.max_concurrency)
            .with_snapshot_path(config.snapshot_path.clone()))
    }

    pub fn with_mode(mut self, mode: StoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    /// At most `limit` sources run at once. Each source issues one request at
    /// a time, so with `limit` no larger than the fetcher's global bound a
    /// running source never queues for a connection permit.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.source_limit = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn with_snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    pub fn store(&self) -> &Arc<PostingStore> {
        &self.store
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.platforms()
    }

    pub async fn detect(&self, organization_key: &str) -> Option<Platform> {
        let ctx = AdapterContext::new();
        self.adapters
            .detect(&self.http, &ctx, organization_key.trim())
            .await
    }

    /// Run one orchestration pass over `sources`.
    ///
    /// Every source runs in its own task under its own timeout, so a hung,
    /// failing or panicking source only shows up in its own report. Overlapping
    /// calls are serialized.
    pub async fn refresh(&self, sources: &[SourceConfig]) -> Result<RefreshSummary, RefreshError> {
        let _gate = self.gate.lock().await;
        let ctx = AdapterContext::new();
        let span = info_span!("refresh", run_id = %ctx.run_id, sources = sources.len());
        self.refresh_inner(sources, ctx).instrument(span).await
    }

    async fn refresh_inner(
        &self,
        sources: &[SourceConfig],
        ctx: AdapterContext,
    ) -> Result<RefreshSummary, RefreshError> {
        let tasks = sources
            .iter()
            .cloned()
            .map(|source| {
                let http = Arc::clone(&self.http);
                let adapters = self.adapters.clone();
                let ctx = ctx.clone();
                let timeout = self.source_timeout;
                let limit = Arc::clone(&self.source_limit);
                tokio::spawn(
                    async move {
                        let _permit = limit.acquire_owned().await.ok();
                        run_source(&http, &adapters, &ctx, &source, timeout).await
                    }
                    .in_current_span(),
                )
            })
            .collect::<Vec<_>>();
        let joined = join_all(tasks).await;

        let mut reports = Vec::with_capacity(sources.len());
        let mut merged = MergedPass::default();
        let mut fetched = HashSet::new();
        let mut unresolved = Vec::new();

        for (source, result) in sources.iter().zip(joined) {
            let run = result.unwrap_or_else(|err| SourceRun::Aborted {
                platform: source.platform.fixed(),
                failure: SourceFailure::new(FailureKind::Internal, format!("source task failed: {err}")),
            });
            let report = match run {
                SourceRun::Skipped => report_for(source, None, SourceStatus::Skipped),
                SourceRun::Ran { platform, outcome } => match outcome {
                    SourceOutcome::Fetched(listing) => {
                        fetched.insert((platform, source.organization_key.clone()));
                        let mut report =
                            report_for(source, Some(platform), SourceStatus::Fetched);
                        report.postings = listing.postings.len();
                        report.dropped_items = listing.dropped_items;
                        merged.extend(listing.postings);
                        report
                    }
                    SourceOutcome::Unavailable => {
                        report_for(source, Some(platform), SourceStatus::Unavailable)
                    }
                    SourceOutcome::Failed(failure) => {
                        let mut report = report_for(source, Some(platform), SourceStatus::Failed);
                        report.failure = Some(failure);
                        report
                    }
                },
                SourceRun::Aborted { platform, failure } => {
                    let mut report = report_for(source, platform, SourceStatus::Failed);
                    report.failure = Some(failure);
                    report
                }
            };
            if report.status != SourceStatus::Fetched {
                unresolved.push((report.platform, report.organization_key.clone()));
            }
            debug!(
                source = %report.requested,
                organization_key = %report.organization_key,
                status = ?report.status,
                postings = report.postings,
                "source finished"
            );
            reports.push(report);
        }

        let postings = merged.into_postings();
        let counts = self.count(&postings);
        let mut ordered = postings.clone();
        ordered.sort_by_key(|p| Reverse(p.ts));

        let changes = match self.mode {
            StoreMode::Upsert => self
                .store
                .merge_batch(postings)
                .await
                .map_err(RefreshError::Merge)?,
            // Records of sources that did not come back this pass survive the swap.
            StoreMode::Replace if !fetched.is_empty() => self
                .store
                .replace_all_keeping(postings, |p| {
                    !fetched.contains(&(p.source, p.organization_key.clone()))
                        && unresolved.iter().any(|(platform, key)| {
                            *key == p.organization_key && platform.map_or(true, |x| x == p.source)
                        })
                })
                .await
                .map_err(RefreshError::Merge)?,
            StoreMode::Replace => MergeStats::default(),
        };

        let snapshot_path = match &self.snapshot_path {
            Some(path) => {
                self.store
                    .save_snapshot(path)
                    .await
                    .map_err(RefreshError::Snapshot)?;
                Some(path.display().to_string())
            }
            None => None,
        };

        Ok(RefreshSummary {
            run_id: ctx.run_id,
            started_at: ctx.fetched_at,
            finished_at: Utc::now(),
            store_mode: self.mode,
            counts,
            changes,
            sources: reports,
            store_total: self.store.len().await,
            store_digest: self.store.digest().await.map_err(RefreshError::Digest)?,
            snapshot_path,
            postings: ordered,
        })
    }

    fn count(&self, postings: &[JobPosting]) -> RefreshCounts {
        let mut per_platform = self
            .adapters
            .platforms()
            .into_iter()
            .map(|p| (p, 0))
            .collect::<BTreeMap<_, _>>();
        for posting in postings {
            *per_platform.entry(posting.source).or_default() += 1;
        }
        RefreshCounts {
            total: postings.len(),
            per_platform,
        }
    }
}

fn report_for(source: &SourceConfig, platform: Option<Platform>, status: SourceStatus) -> SourceReport {
    SourceReport {
        requested: source.platform,
        platform,
        organization_key: source.organization_key.clone(),
        status,
        postings: 0,
        dropped_items: 0,
        failure: None,
    }
}

async fn run_source(
    http: &HttpFetcher,
    adapters: &AdapterRegistry,
    ctx: &AdapterContext,
    source: &SourceConfig,
    timeout: Duration,
) -> SourceRun {
    let key = source.organization_key.as_str();
    let work = async {
        let platform = match source.platform {
            PlatformSelector::Fixed(platform) => platform,
            PlatformSelector::Auto => match adapters.detect(http, ctx, key).await {
                Some(platform) => platform,
                None => return SourceRun::Skipped,
            },
        };
        match adapters.get(platform) {
            Some(adapter) => SourceRun::Ran {
                platform,
                outcome: adapter.fetch(http, ctx, key).await,
            },
            None => SourceRun::Aborted {
                platform: Some(platform),
                failure: SourceFailure::new(
                    FailureKind::Internal,
                    format!("no adapter registered for {platform}"),
                ),
            },
        }
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(run) => run,
        Err(_) => SourceRun::Aborted {
            platform: source.platform.fixed(),
            failure: SourceFailure::new(
                FailureKind::Transient,
                format!("no result within {}ms", timeout.as_millis()),
            ),
        },
    }
}

/// Cross-source fan-in keyed by url, first-seen order preserved.
#[derive(Default)]
struct MergedPass {
    postings: Vec<JobPosting>,
    index: HashMap<String, usize>,
}

impl MergedPass {
    fn extend(&mut self, postings: Vec<JobPosting>) {
        for posting in postings {
            match self.index.get(&posting.url) {
                Some(&idx) => {
                    self.postings[idx].merge_from(&posting);
                }
                None => {
                    self.index.insert(posting.url.clone(), self.postings.len());
                    self.postings.push(posting);
                }
            }
        }
    }

    fn into_postings(self) -> Vec<JobPosting> {
        self.postings
    }
}

/// Config, store and orchestrator wired together for binaries.
pub struct Pipeline {
    pub config: RefreshConfig,
    pub sources: Arc<Vec<SourceConfig>>,
    pub orchestrator: Arc<RefreshOrchestrator>,
}

impl Pipeline {
    pub async fn from_config(config: RefreshConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let store = match &config.snapshot_path {
            Some(path) => PostingStore::load_snapshot(path)
                .await
                .with_context(|| format!("loading snapshot {}", path.display()))?,
            None => PostingStore::new(),
        };
        let orchestrator = RefreshOrchestrator::from_config(&config, Arc::new(store))?;
        Ok(Self {
            sources: Arc::new(registry.enabled_sources()),
            orchestrator: Arc::new(orchestrator),
            config,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(RefreshConfig::from_env()?).await
    }

    pub async fn refresh(&self) -> Result<RefreshSummary, RefreshError> {
        self.orchestrator.refresh(&self.sources).await
    }

    /// Build and start the cron scheduler when enabled.
    pub async fn maybe_start_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.as_str();
        let orchestrator = Arc::clone(&self.orchestrator);
        let sources = Arc::clone(&self.sources);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            let sources = Arc::clone(&sources);
            Box::pin(async move {
                match orchestrator.refresh(&sources).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total = summary.counts.total,
                        inserted = summary.changes.inserted,
                        updated = summary.changes.updated,
                        "scheduled refresh complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jagg_adapters::{AdapterError, ParsedListing, PlatformAdapter};
    use jagg_storage::PostingQuery;

    #[derive(Clone)]
    enum Script {
        Postings(Vec<JobPosting>),
        Delayed(Duration, Vec<JobPosting>),
        Unavailable,
        Fail,
        Panic,
        Hang,
    }

    struct ScriptedAdapter {
        platform: Platform,
        scripts: HashMap<String, Script>,
    }

    impl ScriptedAdapter {
        fn new(platform: Platform, scripts: Vec<(&str, Script)>) -> Arc<Self> {
            Arc::new(Self {
                platform,
                scripts: scripts
                    .into_iter()
                    .map(|(k, s)| (k.to_string(), s))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl PlatformAdapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn listing_url(&self, organization_key: &str) -> String {
            format!("scripted://{}/{organization_key}", self.platform)
        }

        fn board_url(&self, organization_key: &str) -> String {
            self.listing_url(organization_key)
        }

        fn parse_listing(
            &self,
            _organization_key: &str,
            _body: &[u8],
            _ctx: &AdapterContext,
        ) -> std::result::Result<ParsedListing, AdapterError> {
            Ok(ParsedListing::default())
        }

        async fn fetch(&self, _http: &HttpFetcher, _ctx: &AdapterContext, key: &str) -> SourceOutcome {
            let fetched = |postings: Vec<JobPosting>| {
                SourceOutcome::Fetched(ParsedListing {
                    postings,
                    dropped_items: 0,
                })
            };
            match self.scripts.get(key).cloned().unwrap_or(Script::Unavailable) {
                Script::Postings(postings) => fetched(postings),
                Script::Delayed(delay, postings) => {
                    tokio::time::sleep(delay).await;
                    fetched(postings)
                }
                Script::Unavailable => SourceOutcome::Unavailable,
                Script::Fail => SourceOutcome::Failed(SourceFailure::new(
                    FailureKind::Transient,
                    "connection reset",
                )),
                Script::Panic => panic!("adapter exploded"),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    SourceOutcome::Unavailable
                }
            }
        }

        async fn probe(&self, _http: &HttpFetcher, _ctx: &AdapterContext, key: &str) -> bool {
            self.scripts.contains_key(key)
        }
    }

    fn mk_posting(platform: Platform, org: &str, id: &str, ts: i64) -> JobPosting {
        JobPosting {
            source: platform,
            organization_key: org.to_string(),
            title: format!("Role {id}"),
            location: "Remote".to_string(),
            url: format!("https://{platform}.example/{org}/{id}"),
            remote: true,
            created_at: ts,
            updated_at: 0,
            ts,
        }
    }

    fn source(platform: Platform, key: &str) -> SourceConfig {
        SourceConfig::new(PlatformSelector::Fixed(platform), key)
    }

    fn orchestrator(registry: AdapterRegistry, store: Arc<PostingStore>) -> RefreshOrchestrator {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http fetcher");
        RefreshOrchestrator::new(Arc::new(http), registry, store)
            .with_source_timeout(Duration::from_millis(200))
    }

    fn registry(lever: Vec<(&str, Script)>, greenhouse: Vec<(&str, Script)>) -> AdapterRegistry {
        AdapterRegistry::default()
            .with_adapter(ScriptedAdapter::new(Platform::Lever, lever))
            .with_adapter(ScriptedAdapter::new(Platform::Greenhouse, greenhouse))
    }

    fn pass_urls(summary: &RefreshSummary) -> Vec<&str> {
        summary.postings.iter().map(|p| p.url.as_str()).collect()
    }

    async fn urls(store: &PostingStore) -> Vec<String> {
        store
            .list(&PostingQuery::default())
            .await
            .postings
            .into_iter()
            .map(|p| p.url)
            .collect()
    }

    #[tokio::test]
    async fn failing_sources_do_not_affect_siblings() {
        let store = Arc::new(PostingStore::new());
        let orch = orchestrator(
            registry(
                vec![
                    (
                        "alpha",
                        Script::Postings(vec![
                            mk_posting(Platform::Lever, "alpha", "1", 100),
                            mk_posting(Platform::Lever, "alpha", "2", 200),
                        ]),
                    ),
                    ("bravo", Script::Panic),
                ],
                vec![
                    ("charlie", Script::Hang),
                    ("delta", Script::Postings(vec![mk_posting(Platform::Greenhouse, "delta", "1", 300)])),
                    ("echo", Script::Fail),
                ],
            ),
            Arc::clone(&store),
        );
        let sources = vec![
            source(Platform::Lever, "alpha"),
            source(Platform::Lever, "bravo"),
            source(Platform::Greenhouse, "charlie"),
            source(Platform::Greenhouse, "delta"),
            source(Platform::Greenhouse, "echo"),
            source(Platform::Lever, "foxtrot"),
        ];

        let summary = orch.refresh(&sources).await.unwrap();

        assert_eq!(summary.counts.total, 3);
        assert_eq!(summary.counts.per_platform[&Platform::Lever], 2);
        assert_eq!(summary.counts.per_platform[&Platform::Greenhouse], 1);
        let statuses = summary.sources.iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                SourceStatus::Fetched,
                SourceStatus::Failed,
                SourceStatus::Failed,
                SourceStatus::Fetched,
                SourceStatus::Failed,
                SourceStatus::Unavailable,
            ]
        );
        assert_eq!(summary.sources[1].failure.as_ref().unwrap().kind, FailureKind::Internal);
        assert_eq!(summary.sources[2].failure.as_ref().unwrap().kind, FailureKind::Transient);
        assert_eq!(
            pass_urls(&summary),
            vec![
                "https://greenhouse.example/delta/1",
                "https://lever.example/alpha/2",
                "https://lever.example/alpha/1",
            ]
        );
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn ties_follow_declared_source_order_not_completion_order() {
        let store = Arc::new(PostingStore::new());
        let orch = orchestrator(
            registry(
                vec![(
                    "slow",
                    Script::Delayed(
                        Duration::from_millis(50),
                        vec![mk_posting(Platform::Lever, "slow", "1", 500)],
                    ),
                )],
                vec![("fast", Script::Postings(vec![mk_posting(Platform::Greenhouse, "fast", "1", 500)]))],
            ),
            Arc::clone(&store),
        );
        let summary = orch
            .refresh(&[source(Platform::Lever, "slow"), source(Platform::Greenhouse, "fast")])
            .await
            .unwrap();
        let expected = vec!["https://lever.example/slow/1", "https://greenhouse.example/fast/1"];
        assert_eq!(pass_urls(&summary), expected);
        assert_eq!(urls(&store).await, expected);
    }

    #[tokio::test]
    async fn pass_order_follows_declared_sources_even_when_store_order_differs() {
        let store = Arc::new(PostingStore::new());
        // Stored earlier, so the store's own tie-break puts it first.
        store
            .upsert(mk_posting(Platform::Greenhouse, "fast", "1", 500))
            .await
            .unwrap();
        let orch = orchestrator(
            registry(
                vec![("slow", Script::Postings(vec![mk_posting(Platform::Lever, "slow", "1", 500)]))],
                vec![("fast", Script::Postings(vec![mk_posting(Platform::Greenhouse, "fast", "1", 500)]))],
            ),
            Arc::clone(&store),
        );
        let summary = orch
            .refresh(&[source(Platform::Lever, "slow"), source(Platform::Greenhouse, "fast")])
            .await
            .unwrap();
        assert_eq!(
            pass_urls(&summary),
            vec!["https://lever.example/slow/1", "https://greenhouse.example/fast/1"]
        );
        assert_eq!(
            urls(&store).await,
            vec!["https://greenhouse.example/fast/1", "https://lever.example/slow/1"]
        );
    }

    #[tokio::test]
    async fn queued_sources_are_not_charged_for_waiting() {
        let store = Arc::new(PostingStore::new());
        let delayed = |org: &str| {
            Script::Delayed(
                Duration::from_millis(120),
                vec![mk_posting(Platform::Lever, org, "1", 10)],
            )
        };
        let orch = orchestrator(
            registry(
                vec![("one", delayed("one")), ("two", delayed("two")), ("three", delayed("three"))],
                vec![],
            ),
            Arc::clone(&store),
        )
        .with_max_concurrency(1);
        let summary = orch
            .refresh(&[
                source(Platform::Lever, "one"),
                source(Platform::Lever, "two"),
                source(Platform::Lever, "three"),
            ])
            .await
            .unwrap();
        assert_eq!(summary.sources_with(SourceStatus::Fetched), 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn same_url_from_two_sources_is_stored_once() {
        let store = Arc::new(PostingStore::new());
        let mut sparse = mk_posting(Platform::Lever, "alpha", "1", 0);
        sparse.location = jagg_core::UNKNOWN_LOCATION.to_string();
        sparse.created_at = 0;
        let mut richer = sparse.clone();
        richer.location = "Remote - EU".to_string();
        richer.updated_at = 900;
        richer.ts = 900;

        let orch = orchestrator(
            registry(
                vec![
                    ("alpha", Script::Postings(vec![sparse])),
                    ("alpha-mirror", Script::Postings(vec![richer])),
                ],
                vec![],
            ),
            Arc::clone(&store),
        );
        let summary = orch
            .refresh(&[source(Platform::Lever, "alpha"), source(Platform::Lever, "alpha-mirror")])
            .await
            .unwrap();
        assert_eq!(summary.counts.total, 1);
        assert_eq!(store.len().await, 1);
        let stored = store.get_by_url("https://lever.example/alpha/1").await.unwrap();
        assert_eq!(stored.location, "Remote - EU");
        assert_eq!(stored.ts, 900);
    }

    #[tokio::test]
    async fn all_sources_down_keeps_previous_postings() {
        for mode in [StoreMode::Upsert, StoreMode::Replace] {
            let store = Arc::new(PostingStore::new());
            store
                .upsert(mk_posting(Platform::Lever, "alpha", "cached", 42))
                .await
                .unwrap();
            let before = store.digest().await.unwrap();
            let orch = orchestrator(
                registry(vec![("alpha", Script::Fail)], vec![("beta", Script::Hang)]),
                Arc::clone(&store),
            )
            .with_mode(mode);

            let summary = orch
                .refresh(&[source(Platform::Lever, "alpha"), source(Platform::Greenhouse, "beta")])
                .await
                .unwrap();
            assert_eq!(summary.counts.total, 0);
            assert_eq!(summary.changes, MergeStats::default());
            assert_eq!(summary.store_total, 1);
            assert_eq!(summary.store_digest, before);
        }
    }

    #[tokio::test]
    async fn replace_mode_drops_postings_missing_from_a_fetched_pass() {
        let store = Arc::new(PostingStore::new());
        store
            .upsert(mk_posting(Platform::Lever, "alpha", "old", 1))
            .await
            .unwrap();
        let orch = orchestrator(
            registry(
                vec![("alpha", Script::Postings(vec![mk_posting(Platform::Lever, "alpha", "new", 2)]))],
                vec![],
            ),
            Arc::clone(&store),
        )
        .with_mode(StoreMode::Replace);
        let summary = orch.refresh(&[source(Platform::Lever, "alpha")]).await.unwrap();
        assert_eq!(summary.changes.inserted, 1);
        assert_eq!(summary.changes.removed, 1);
        assert_eq!(urls(&store).await, vec!["https://lever.example/alpha/new"]);
    }

    #[tokio::test]
    async fn replace_mode_keeps_postings_of_sources_that_did_not_fetch() {
        let store = Arc::new(PostingStore::new());
        store
            .merge_batch(vec![
                mk_posting(Platform::Lever, "alpha", "cached", 1),
                mk_posting(Platform::Lever, "gamma", "cached", 3),
                mk_posting(Platform::Greenhouse, "beta", "stale", 2),
            ])
            .await
            .unwrap();
        let orch = orchestrator(
            registry(
                vec![("alpha", Script::Fail)],
                vec![("beta", Script::Postings(vec![mk_posting(Platform::Greenhouse, "beta", "1", 5)]))],
            ),
            Arc::clone(&store),
        )
        .with_mode(StoreMode::Replace);

        let summary = orch
            .refresh(&[
                source(Platform::Lever, "alpha"),
                source(Platform::Greenhouse, "beta"),
                SourceConfig::new(PlatformSelector::Auto, "gamma"),
            ])
            .await
            .unwrap();
        let statuses = summary.sources.iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![SourceStatus::Failed, SourceStatus::Fetched, SourceStatus::Skipped]
        );
        assert_eq!(summary.changes.inserted, 1);
        assert_eq!(summary.changes.removed, 1);
        assert_eq!(
            urls(&store).await,
            vec![
                "https://greenhouse.example/beta/1",
                "https://lever.example/gamma/cached",
                "https://lever.example/alpha/cached",
            ]
        );
    }

    #[tokio::test]
    async fn repeated_refresh_is_idempotent() {
        let store = Arc::new(PostingStore::new());
        let orch = orchestrator(
            registry(
                vec![("alpha", Script::Postings(vec![mk_posting(Platform::Lever, "alpha", "1", 10)]))],
                vec![("beta", Script::Postings(vec![mk_posting(Platform::Greenhouse, "beta", "1", 20)]))],
            ),
            Arc::clone(&store),
        );
        let sources = [source(Platform::Lever, "alpha"), source(Platform::Greenhouse, "beta")];
        let first = orch.refresh(&sources).await.unwrap();
        let second = orch.refresh(&sources).await.unwrap();

        assert_eq!(first.counts, second.counts);
        assert_eq!(first.store_digest, second.store_digest);
        assert_eq!(first.changes.inserted, 2);
        assert_eq!(second.changes.unchanged, 2);
        assert_eq!(second.changes.inserted + second.changes.updated, 0);
    }

    #[tokio::test]
    async fn auto_sources_are_detected_or_skipped() {
        let store = Arc::new(PostingStore::new());
        let orch = orchestrator(
            registry(
                vec![],
                vec![("gamma", Script::Postings(vec![mk_posting(Platform::Greenhouse, "gamma", "1", 5)]))],
            ),
            Arc::clone(&store),
        );
        let summary = orch
            .refresh(&[
                SourceConfig::new(PlatformSelector::Auto, "gamma"),
                SourceConfig::new(PlatformSelector::Auto, "nowhere"),
            ])
            .await
            .unwrap();
        assert_eq!(summary.sources[0].platform, Some(Platform::Greenhouse));
        assert_eq!(summary.sources[0].status, SourceStatus::Fetched);
        assert_eq!(summary.sources[1].platform, None);
        assert_eq!(summary.sources[1].status, SourceStatus::Skipped);
        assert_eq!(summary.sources_with(SourceStatus::Skipped), 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(orch.detect("gamma").await, Some(Platform::Greenhouse));
    }

    #[tokio::test]
    async fn snapshot_is_written_after_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("postings.json");
        let store = Arc::new(PostingStore::new());
        let orch = orchestrator(
            registry(
                vec![("alpha", Script::Postings(vec![mk_posting(Platform::Lever, "alpha", "1", 10)]))],
                vec![],
            ),
            Arc::clone(&store),
        )
        .with_snapshot_path(Some(path.clone()));
        let summary = orch.refresh(&[source(Platform::Lever, "alpha")]).await.unwrap();
        assert!(summary.snapshot_path.is_some());

        let restored = PostingStore::load_snapshot(&path).await.unwrap();
        assert_eq!(restored.digest().await.unwrap(), summary.store_digest);
    }

    #[test]
    fn registry_yaml_filters_and_dedups() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - platform: lever
    organization_key: " vercel "
  - platform: Greenhouse
    organization_key: stripe
  - platform: auto
    organization_key: figma
  - platform: lever
    organization_key: vercel
  - platform: lever
    organization_key: ramp
    enabled: false
  - platform: greenhouse
    organization_key: ""
"#,
        )
        .unwrap();
        let enabled = registry.enabled_sources();
        assert_eq!(
            enabled
                .iter()
                .map(|s| (s.platform.to_string(), s.organization_key.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("lever".to_string(), "vercel"),
                ("greenhouse".to_string(), "stripe"),
                ("auto".to_string(), "figma"),
            ]
        );
    }

    #[test]
    fn registry_rejects_unknown_platforms() {
        let err = SourceRegistry::from_yaml_str(
            "sources:\n  - platform: workday\n    organization_key: acme\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("workday"));
    }

    #[test]
    fn counts_serialize_flat() {
        let counts = RefreshCounts {
            total: 3,
            per_platform: BTreeMap::from([(Platform::Lever, 2), (Platform::Greenhouse, 1)]),
        };
        assert_eq!(
            serde_json::to_value(&counts).unwrap(),
            serde_json::json!({"total": 3, "lever": 2, "greenhouse": 1})
        );
    }

    #[test]
    fn store_mode_parses() {
        assert_eq!("Upsert".parse::<StoreMode>().unwrap(), StoreMode::Upsert);
        assert_eq!("replace".parse::<StoreMode>().unwrap(), StoreMode::Replace);
        assert!("merge".parse::<StoreMode>().is_err());
    }
}
