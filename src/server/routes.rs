use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::models::{
    Crawl, CrawlKind, CrawlStatusKind, CrawlerOptions, InternalOptions, JobMode, Plan, ScrapeJob,
    ScrapeOptions, Webhook,
};
use crate::queue::priority::{BASE_KICKOFF, BASE_SINGLE_SCRAPE};
use crate::store::StoreError;
use crate::AppState;

/// Page size for crawl status data.
const STATUS_PAGE_SIZE: usize = 100;

fn default_plan() -> Plan {
    Plan::Free
}

fn store_error(e: StoreError) -> axum::response::Response {
    tracing::error!(error = %e, "State store error");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "state store unavailable" })),
    )
        .into_response()
}

// --- Scrapes ---

#[derive(Debug, Deserialize)]
pub struct ScrapeSubmission {
    pub url: String,
    pub tenant_id: String,
    #[serde(default = "default_plan")]
    pub plan: Plan,
    #[serde(default)]
    pub scrape_options: ScrapeOptions,
    #[serde(default)]
    pub internal_options: InternalOptions,
    #[serde(default)]
    pub webhook: Option<Webhook>,
}

/// POST /api/v1/scrape
///
/// Admit a single-page scrape. Returns 202 with the job id and a status URL
/// to poll for the document.
pub async fn submit_scrape(
    State(state): State<AppState>,
    Json(submission): Json<ScrapeSubmission>,
) -> impl IntoResponse {
    let job = ScrapeJob {
        job_id: Uuid::new_v4().to_string(),
        url: submission.url,
        mode: JobMode::Single,
        tenant_id: submission.tenant_id,
        plan: submission.plan,
        crawl_id: None,
        scrape_options: submission.scrape_options,
        internal_options: InternalOptions {
            base_priority: BASE_SINGLE_SCRAPE,
            ..submission.internal_options
        },
        origin: "api".to_string(),
        webhook: submission.webhook,
        depth: 0,
    };

    tracing::info!(job_id = %job.job_id, url = %job.url, tenant_id = %job.tenant_id, "Received scrape");

    let priority = match state
        .scorer
        .score_for_enqueue(&job.tenant_id, job.plan, &job.job_id, job.internal_options.base_priority)
        .await
    {
        Ok(priority) => priority,
        Err(e) => return store_error(e),
    };
    if let Err(e) = state.admission.admit(&job, priority).await {
        return store_error(e);
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.job_id,
            "status_url": format!("/api/v1/scrape/{}", job.job_id),
        })),
    )
        .into_response()
}

/// GET /api/v1/scrape/{id}
pub async fn get_scrape(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let job_state = match state.scheduler.state(&job_id).await {
        Ok(Some(job_state)) => job_state,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown job" })),
            )
                .into_response()
        }
        Err(e) => return store_error(e),
    };
    let document = match state.scheduler.result(&job_id).await {
        Ok(document) => document,
        Err(e) => return store_error(e),
    };
    let error = match state.scheduler.error(&job_id).await {
        Ok(error) => error,
        Err(e) => return store_error(e),
    };

    (
        StatusCode::OK,
        Json(json!({
            "job_id": job_id,
            "state": job_state,
            "data": document,
            "error": error,
        })),
    )
        .into_response()
}

// --- Crawls ---

#[derive(Debug, Deserialize)]
pub struct CrawlSubmission {
    pub url: String,
    pub tenant_id: String,
    #[serde(default = "default_plan")]
    pub plan: Plan,
    #[serde(default)]
    pub crawler_options: CrawlerOptions,
    #[serde(default)]
    pub scrape_options: ScrapeOptions,
    #[serde(default)]
    pub internal_options: InternalOptions,
    #[serde(default)]
    pub webhook: Option<Webhook>,
}

/// POST /api/v1/crawl
///
/// Register a crawl and admit its kickoff job.
pub async fn submit_crawl(
    State(state): State<AppState>,
    Json(submission): Json<CrawlSubmission>,
) -> impl IntoResponse {
    let crawl = Crawl {
        crawl_id: Uuid::new_v4().to_string(),
        origin_url: submission.url.clone(),
        tenant_id: submission.tenant_id,
        plan: submission.plan,
        kind: CrawlKind::Crawl,
        seed_urls: Vec::new(),
        crawler_options: submission.crawler_options,
        scrape_options: submission.scrape_options,
        internal_options: submission.internal_options,
        robots_txt: None,
        created_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        cancelled: false,
        webhook: submission.webhook,
    };

    tracing::info!(crawl_id = %crawl.crawl_id, url = %crawl.origin_url, "Received crawl");

    match start_crawl(&state, crawl).await {
        Ok(response) => response.into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchSubmission {
    pub urls: Vec<String>,
    pub tenant_id: String,
    #[serde(default = "default_plan")]
    pub plan: Plan,
    #[serde(default)]
    pub scrape_options: ScrapeOptions,
    #[serde(default)]
    pub internal_options: InternalOptions,
    #[serde(default)]
    pub webhook: Option<Webhook>,
}

/// POST /api/v1/batch
///
/// Bulk extraction: scrape an explicit URL list through the same crawl
/// machinery, without link discovery.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(submission): Json<BatchSubmission>,
) -> impl IntoResponse {
    let origin_url = submission.urls.first().cloned().unwrap_or_default();
    let crawl = Crawl {
        crawl_id: Uuid::new_v4().to_string(),
        origin_url,
        tenant_id: submission.tenant_id,
        plan: submission.plan,
        kind: CrawlKind::BatchScrape,
        seed_urls: submission.urls,
        crawler_options: CrawlerOptions {
            // Batch seeds are caller-provided; never drop near-duplicates.
            deduplicate_similar_urls: false,
            ..CrawlerOptions::default()
        },
        scrape_options: submission.scrape_options,
        internal_options: submission.internal_options,
        robots_txt: None,
        created_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        cancelled: false,
        webhook: submission.webhook,
    };

    tracing::info!(crawl_id = %crawl.crawl_id, urls = crawl.seed_urls.len(), "Received batch scrape");

    match start_crawl(&state, crawl).await {
        Ok(response) => response.into_response(),
        Err(e) => store_error(e),
    }
}

async fn start_crawl(
    state: &AppState,
    crawl: Crawl,
) -> Result<(StatusCode, Json<serde_json::Value>), StoreError> {
    state.registry.save_crawl(&crawl).await?;

    let kickoff = ScrapeJob {
        job_id: Uuid::new_v4().to_string(),
        url: crawl.origin_url.clone(),
        mode: JobMode::Kickoff,
        tenant_id: crawl.tenant_id.clone(),
        plan: crawl.plan,
        crawl_id: Some(crawl.crawl_id.clone()),
        scrape_options: crawl.scrape_options.clone(),
        internal_options: InternalOptions {
            base_priority: BASE_KICKOFF,
            ..crawl.internal_options.clone()
        },
        origin: "api".to_string(),
        webhook: crawl.webhook.clone(),
        depth: 0,
    };

    let priority = state
        .scorer
        .score_for_enqueue(&kickoff.tenant_id, kickoff.plan, &kickoff.job_id, BASE_KICKOFF)
        .await?;
    state.admission.admit(&kickoff, priority).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "crawl_id": crawl.crawl_id,
            "status_url": format!("/api/v1/crawl/{}", crawl.crawl_id),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub skip: usize,
}

/// GET /api/v1/crawl/{id}
///
/// Poll crawl progress. Documents are paginated; `next` is present while
/// more pages remain.
pub async fn crawl_status(
    State(state): State<AppState>,
    Path(crawl_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    match build_status(&state, &crawl_id, query.skip).await {
        Ok(Some(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown crawl" })),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

async fn build_status(
    state: &AppState,
    crawl_id: &str,
    skip: usize,
) -> Result<Option<serde_json::Value>, StoreError> {
    if state.registry.get_crawl(crawl_id).await?.is_none() {
        return Ok(None);
    }

    let status = state.registry.status(crawl_id).await?;
    let total = state.registry.enrolled_count(crawl_id).await?;
    let completed = state.registry.done_count(crawl_id).await?;

    let mut data = Vec::new();
    let mut next = None;
    if !matches!(status, CrawlStatusKind::Pending) {
        let job_ids = state.registry.job_ids(crawl_id).await?;
        let page: Vec<_> = job_ids.iter().skip(skip).take(STATUS_PAGE_SIZE).collect();
        for job_id in &page {
            if let Some(document) = state.scheduler.result(job_id).await? {
                data.push(serde_json::to_value(document).unwrap_or_default());
            } else if let Some(error) = state.scheduler.error(job_id).await? {
                data.push(json!({ "success": false, "error": error }));
            }
        }
        if skip + page.len() < job_ids.len() {
            next = Some(format!(
                "/api/v1/crawl/{crawl_id}?skip={}",
                skip + page.len()
            ));
        }
    }

    Ok(Some(json!({
        "status": status,
        "total": total,
        "completed": completed,
        "data": data,
        "next": next,
    })))
}

/// DELETE /api/v1/crawl/{id}
pub async fn crawl_cancel(
    State(state): State<AppState>,
    Path(crawl_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!(crawl_id = %crawl_id, "Cancel request");
    match state.registry.cancel(&crawl_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "crawl_id": crawl_id, "status": "cancelled" })),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
