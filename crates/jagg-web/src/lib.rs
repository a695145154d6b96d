//! Axum JSON API over the posting store and the refresh orchestrator.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jagg_core::{JobPosting, Platform};
use jagg_storage::PostingQuery;
use jagg_sync::{Pipeline, RefreshOrchestrator, RefreshSummary, SourceConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jagg-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub sources: Arc<Vec<SourceConfig>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<RefreshOrchestrator>, sources: Arc<Vec<SourceConfig>>) -> Self {
        Self {
            orchestrator,
            sources,
        }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(
            Arc::clone(&pipeline.orchestrator),
            Arc::clone(&pipeline.sources),
        )
    }
}

/// A stored posting plus its derived id.
#[derive(Debug, Clone, Serialize)]
pub struct PostingView {
    pub id: Uuid,
    #[serde(flatten)]
    pub posting: JobPosting,
}

impl From<JobPosting> for PostingView {
    fn from(posting: JobPosting) -> Self {
        Self {
            id: posting.id(),
            posting,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    source: Option<Platform>,
    q: Option<String>,
    company: Option<String>,
    location: Option<String>,
    remote: Option<bool>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobsPage {
    page: usize,
    per_page: usize,
    total: usize,
    total_pages: usize,
    jobs: Vec<PostingView>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    status: &'static str,
    #[serde(flatten)]
    summary: RefreshSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/refresh", post(refresh_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: &Pipeline, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, sources = pipeline.sources.len(), "serving job api");
    axum::serve(listener, app(AppState::from_pipeline(pipeline))).await?;
    Ok(())
}

pub fn web_port_from_env() -> u16 {
    std::env::var("JAGG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = Pipeline::from_env().await?;
    let _scheduler = pipeline.maybe_start_scheduler().await?;
    serve(&pipeline, web_port_from_env()).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let postings = state.orchestrator.store().len().await;
    Json(json!({ "status": "ok", "postings": postings })).into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "platforms": state.orchestrator.platforms(),
        "sources": state.sources.as_ref(),
    }))
    .into_response()
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let filter = PostingQuery {
        source: query.source,
        q: query.q.clone(),
        company: query.company.clone(),
        location: query.location.clone(),
        remote: query.remote,
        ..PostingQuery::default()
    };
    let matching = state.orchestrator.store().list(&filter).await;
    Json(paginate(matching.postings, &query)).into_response()
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return client_error(StatusCode::BAD_REQUEST, format!("invalid job id `{id}`"));
    };
    match state.orchestrator.store().get(id).await {
        Some(posting) => Json(PostingView::from(posting)).into_response(),
        None => client_error(StatusCode::NOT_FOUND, format!("job {id} not found")),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.refresh(&state.sources).await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                total = summary.counts.total,
                inserted = summary.changes.inserted,
                updated = summary.changes.updated,
                "refresh complete"
            );
            Json(RefreshResponse {
                status: "ok",
                summary,
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "refresh failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Refresh failed: {err}") })),
            )
                .into_response()
        }
    }
}

fn client_error(status: StatusCode, detail: String) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn paginate(all: Vec<JobPosting>, query: &JobsQuery) -> JobsPage {
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let total = all.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let jobs = all
        .into_iter()
        .skip(start)
        .take(per_page)
        .map(PostingView::from)
        .collect();
    JobsPage {
        page,
        per_page,
        total,
        total_pages,
        jobs,
    }
}
