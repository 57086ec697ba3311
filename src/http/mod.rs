//! HTTP control plane.
//!
//! Exposes the trigger/status surface over the job coordinator plus the
//! read-only rollup data APIs. Payload shapes follow the service's JSON
//! envelope convention: every response carries a `status` field.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::catalog::{CatalogError, CompanyCatalog};
use crate::jobs::{JobCoordinator, JobInfo, JobKind, SubmitError};
use crate::models::Granularity;
use crate::rollup::SiteForest;
use crate::store::{RecordStore, RollupFilter};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RecordStore>,
    pub catalog: Arc<dyn CompanyCatalog>,
    pub coordinator: JobCoordinator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/run-aggregation", post(run_aggregation))
        .route("/start-rollup", post(start_rollup))
        .route("/status/{job_id}", get(job_status))
        .route("/list-threads", get(list_threads))
        .route("/api/rollup/data", get(rollup_data))
        .route("/api/rollup/status", get(rollup_status))
        .route("/api/rollup/sites/{company_id}", get(rollup_sites))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("🚀 Control plane listening on http://0.0.0.0:{}", port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "esg-aggregation-pipeline",
        "status": "running",
        "endpoints": {
            "health": "/health",
            "aggregation": "/run-aggregation",
            "rollup": "/start-rollup",
            "rollup_status": "/api/rollup/status",
            "rollup_data": "/api/rollup/data",
            "rollup_sites": "/api/rollup/sites/{company_id}",
            "status": "/status/{job_id}",
            "threads": "/list-threads",
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let active = state.coordinator.active_count();
    match state.catalog.list_companies().await {
        Ok(companies) => Json(json!({
            "status": "healthy",
            "message": "Service is running",
            "api_status": if companies.is_empty() { "disconnected" } else { "connected" },
            "active_threads": active,
        })),
        Err(e) => Json(json!({
            "status": "degraded",
            "message": format!("Service is running but encountered an error: {}", e),
            "active_threads": active,
        })),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerBody {
    company_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    company_id: Option<String>,
}

/// The trigger endpoints accept the company id from either the JSON body or
/// the query string; anything non-integer is a client error.
fn parse_company_id(
    body: Option<&Value>,
    query: Option<&str>,
) -> Result<Option<i64>, &'static str> {
    const INVALID: &str = "Invalid company_id. Must be an integer.";
    let raw = body
        .cloned()
        .or_else(|| query.map(|s| Value::String(s.to_string())));
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(INVALID),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed.parse::<i64>().map(Some).map_err(|_| INVALID)
            }
        }
        Some(_) => Err(INVALID),
    }
}

fn submit(
    state: &AppState,
    kind: JobKind,
    body: Option<&TriggerBody>,
    query: &TriggerQuery,
) -> (StatusCode, Json<Value>) {
    let company_id = match parse_company_id(
        body.and_then(|b| b.company_id.as_ref()),
        query.company_id.as_deref(),
    ) {
        Ok(id) => id,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "error": message})),
            );
        }
    };

    match state.coordinator.submit(kind, company_id) {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "started",
                "message": format!("{} process has been started in the background.", kind.as_str()),
                "company_id": company_id,
                "job_id": job_id,
            })),
        ),
        Err(SubmitError::AlreadyRunning { job_id, company, kind }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "already_running",
                "message": format!("{} for company_id {} is already running.", kind, company),
                "job_id": job_id,
            })),
        ),
    }
}

async fn run_aggregation(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    body: Option<Json<TriggerBody>>,
) -> (StatusCode, Json<Value>) {
    submit(
        &state,
        JobKind::Aggregation,
        body.as_ref().map(|j| &j.0),
        &query,
    )
}

async fn start_rollup(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    body: Option<Json<TriggerBody>>,
) -> (StatusCode, Json<Value>) {
    submit(
        &state,
        JobKind::Rollup,
        body.as_ref().map(|j| &j.0),
        &query,
    )
}

fn job_json(job: &JobInfo) -> Value {
    json!({
        "job_id": job.job_id,
        "type": job.kind,
        "company_id": job.company_id,
        "status": job.status,
        "message": job.message,
        "start_time": job.started_at,
        "end_time": job.ended_at,
        "duration": job.duration_secs(),
        "summary": job.summary,
    })
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.coordinator.status(&job_id) {
        Some(job) => (
            StatusCode::OK,
            Json(json!({"status": "success", "thread_info": job_json(&job)})),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "error": "Job ID not found"})),
        ),
    }
}

async fn list_threads(State(state): State<AppState>) -> Json<Value> {
    let jobs = state.coordinator.list();
    Json(json!({
        "status": "success",
        "threads": jobs.iter().map(job_json).collect::<Vec<_>>(),
        "count": jobs.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct RollupDataQuery {
    company_id: Option<String>,
    frequency: Option<String>,
    year: Option<i32>,
    internal_code_id: Option<String>,
    limit: Option<i64>,
    skip: Option<i64>,
}

async fn rollup_data(
    State(state): State<AppState>,
    Query(query): Query<RollupDataQuery>,
) -> (StatusCode, Json<Value>) {
    let frequency = query.frequency.as_deref().unwrap_or("yearly");
    let granularity = match Granularity::from_api_name(frequency) {
        Some(g) => g,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "error": "Invalid frequency. Expected monthly, quarterly, bi_annual or yearly.",
                })),
            );
        }
    };

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let skip = query.skip.unwrap_or(0).max(0);
    let filter = RollupFilter {
        company_code: query.company_id.clone(),
        type_year: query.year,
        internal_code_id: query.internal_code_id.clone(),
        limit,
        skip,
    };

    match state.store.find_rollups(granularity, &filter).await {
        Ok((records, total)) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "data": {
                    "records": records,
                    "pagination": {
                        "total": total,
                        "limit": limit,
                        "skip": skip,
                        "has_more": skip + limit < total,
                    },
                    "filters": {
                        "company_id": query.company_id,
                        "frequency": frequency,
                        "year": query.year,
                        "internal_code_id": query.internal_code_id,
                    },
                }
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct RollupStatusQuery {
    company_id: Option<String>,
    frequency: Option<String>,
}

async fn rollup_status(
    State(state): State<AppState>,
    Query(query): Query<RollupStatusQuery>,
) -> (StatusCode, Json<Value>) {
    let frequency = query.frequency.as_deref().unwrap_or("all");
    let mut data = serde_json::Map::new();
    let mut company_specific = serde_json::Map::new();

    for granularity in Granularity::ALL {
        if frequency != "all" && frequency != granularity.api_name() {
            continue;
        }
        let count = match state.store.count_rollups(granularity, None).await {
            Ok(n) => n,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "error", "error": e.to_string()})),
                );
            }
        };
        data.insert(granularity.api_name().to_string(), json!(count));

        if let Some(company) = &query.company_id {
            match state.store.count_rollups(granularity, Some(company)).await {
                Ok(n) => {
                    company_specific.insert(granularity.api_name().to_string(), json!(n));
                }
                Err(e) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"status": "error", "error": e.to_string()})),
                    );
                }
            }
        }
    }
    if !company_specific.is_empty() {
        data.insert("company_specific".to_string(), Value::Object(company_specific));
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "data": data,
            "timestamp": chrono::Utc::now(),
        })),
    )
}

async fn rollup_sites(
    State(state): State<AppState>,
    Path(company_id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    match state.catalog.get_company(company_id).await {
        Ok(company) => {
            let forest = SiteForest::from_sites(&company.sites);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "data": {
                        "company_id": company_id,
                        "site_hierarchy": forest.to_json(),
                    }
                })),
            )
        }
        Err(CatalogError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "error": format!("Could not fetch site data for company {}", company_id),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        ),
    }
}
