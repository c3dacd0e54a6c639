//! HTTP gateway.
//!
//! Serves the faceted search gateway, the indicator engine, and a few
//! pipeline maintenance endpoints as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Faceted search with filter-excluded aggregations |
//! | `POST` | `/filters` | Facet buckets only, cached |
//! | `GET`  | `/search-item` | Search-as-you-type suggestions for one field |
//! | `POST` | `/indicators` | Compute an indicator and its chart payload |
//! | `POST` | `/scripts/{id}/run` | Run a transformation script, optionally for one identifier |
//! | `GET`  | `/records/failed` | Failed records with the errors of their latest attempt |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown data source: x" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser dashboards
//! can call the gateway directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{request_error, RequestError};
use crate::bronze::TransformOutcome;
use crate::gateway::{
    FacetsRequest, FacetsResponse, SearchGateway, SearchRequest, SearchResponse, SuggestRequest,
};
use crate::harvest::failed_records;
use crate::indicator::{IndicatorEngine, IndicatorSpec};
use crate::models::RecordSource;
use crate::pipeline::Pipeline;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: Pipeline,
    gateway: Arc<SearchGateway>,
    indicators: Arc<IndicatorEngine>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        let gateway = Arc::new(SearchGateway::new(
            pipeline.backend().clone(),
            pipeline.shared_config(),
        ));
        let indicators = Arc::new(IndicatorEngine::new(
            pipeline.backend().clone(),
            pipeline.shared_config(),
        ));
        Self {
            pipeline,
            gateway,
            indicators,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/filters", post(handle_filters))
        .route("/search-item", get(handle_search_item))
        .route("/indicators", post(handle_indicators))
        .route("/scripts/{id}/run", post(handle_run_script))
        .route("/records/failed", get(handle_failed_records))
        .layer(cors)
        .with_state(state)
}

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(pipeline: Pipeline) -> anyhow::Result<()> {
    let bind_addr = pipeline.config().server.bind.clone();
    let app = router(AppState::new(pipeline));

    tracing::info!(bind = %bind_addr, "gateway listening");
    println!("Gateway listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

/// Request errors become 400/404; everything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match request_error(&err) {
            Some(RequestError::NotFound(_)) => not_found(err.to_string()),
            Some(_) => bad_request(err.to_string()),
            None => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                internal(format!("{:#}", err))
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Gateway ============

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    Ok(Json(state.gateway.search(&request).await?))
}

async fn handle_filters(
    State(state): State<AppState>,
    Json(request): Json<FacetsRequest>,
) -> Result<Json<FacetsResponse>, AppError> {
    Ok(Json(state.gateway.facets(&request).await?))
}

async fn handle_search_item(
    State(state): State<AppState>,
    Query(request): Query<SuggestRequest>,
) -> Result<Json<Value>, AppError> {
    let suggestions = state.gateway.suggest(&request).await?;
    Ok(Json(json!({ "results": suggestions })))
}

// ============ POST /indicators ============

async fn handle_indicators(
    State(state): State<AppState>,
    Json(spec): Json<IndicatorSpec>,
) -> Result<Json<Value>, AppError> {
    if spec.facet_by.trim().is_empty() {
        return Err(bad_request("facet_by must not be empty"));
    }
    let result = state.indicators.generate(&spec).await?;
    Ok(Json(json!({
        "title": result.title,
        "results": result.to_output(),
        "chart": result.to_chart(),
    })))
}

// ============ Pipeline maintenance ============

#[derive(Deserialize)]
struct RunScriptParams {
    identifier: Option<String>,
}

async fn handle_run_script(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<RunScriptParams>,
) -> Result<Json<TransformOutcome>, AppError> {
    let identifier = params.identifier.as_deref().filter(|s| !s.trim().is_empty());
    let outcome = state
        .pipeline
        .transformer()
        .transform_by_id(state.pipeline.store(), id, identifier)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct FailedParams {
    source: String,
}

async fn handle_failed_records(
    State(state): State<AppState>,
    Query(params): Query<FailedParams>,
) -> Result<Json<Value>, AppError> {
    let source: RecordSource = params
        .source
        .parse()
        .map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let records = failed_records(state.pipeline.store(), source).await?;
    Ok(Json(json!({ "source": source, "records": records })))
}
