//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use spandb_core::db::Db;
use spandb_core::ingester::Ingester;
use spandb_core::model::{ObjectDecoder, Trace};
use spandb_core::{BlockMeta, CompactedBlockMeta, SpanError, BLOCK_ID_MAX, BLOCK_ID_MIN};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub ingester: Arc<Ingester>,
    pub decoder: Arc<dyn ObjectDecoder>,
    pub registry: Registry,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ready", get(ready))
        .route("/api/v1/push/:tenant", post(push))
        .route("/api/v1/traces/:tenant/:id", get(find_trace))
        .route("/api/v1/blocks/:tenant", get(list_blocks))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub traces: Vec<Trace>,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub accepted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct FindParams {
    /// Lowest block ID searched, inclusive
    block_start: Option<String>,
    /// Highest block ID searched, inclusive
    block_end: Option<String>,
    /// Unix seconds; the window applies when both ends are set
    start: Option<i64>,
    end: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub trace: Trace,
    /// Blocks that could not be searched
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_blocks: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BlocksResponse {
    pub blocks: Vec<BlockMeta>,
    pub compacted: Vec<CompactedBlockMeta>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: SpanError) -> ApiError {
    let status = match &e {
        SpanError::Validation(_) => StatusCode::BAD_REQUEST,
        SpanError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
        SpanError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        SpanError::DoesNotExist(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn ready() -> &'static str {
    "ready"
}

async fn push(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let mut accepted = 0;

    for trace in &req.traces {
        let (start, end) = trace.time_range().unwrap_or((now, now));
        let object = state
            .decoder
            .prepare_for_write(trace, start.max(0) as u32, end.max(0) as u32)
            .map_err(api_error)?;
        state
            .ingester
            .push(&tenant, &trace.id, &object, start, end)
            .map_err(api_error)?;
        accepted += 1;
    }

    Ok(Json(PushResponse { accepted }))
}

async fn find_trace(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    Query(params): Query<FindParams>,
) -> Result<Json<TraceResponse>, ApiError> {
    let id = hex::decode(&id)
        .map_err(|e| api_error(SpanError::Validation(format!("trace id is not hex: {}", e))))?;

    // dropped with the request, which stops both lookups
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let mut objects = Vec::new();
    if let Some(object) = state
        .ingester
        .find_by_id(&tenant, &id, &cancel)
        .await
        .map_err(api_error)?
    {
        objects.push(object);
    }

    let block_start = params.block_start.as_deref().unwrap_or(BLOCK_ID_MIN);
    let block_end = params.block_end.as_deref().unwrap_or(BLOCK_ID_MAX);
    let (start, end) = match (params.start, params.end) {
        (Some(start), Some(end)) => (start, end),
        _ => (0, 0),
    };

    let found = state
        .db
        .find(&tenant, &id, block_start, block_end, start, end, &cancel)
        .await
        .map_err(api_error)?;
    if !found.failed_blocks.is_empty() {
        warn!(tenant = %tenant, failed = found.failed_blocks.len(), "trace lookup skipped failed blocks");
    }
    objects.extend(found.objects);

    if objects.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("trace {} not found", hex::encode(&id)),
            }),
        ));
    }

    let parts: Vec<&[u8]> = objects.iter().map(Vec::as_slice).collect();
    let combined = state.decoder.combine(&parts).map_err(api_error)?;
    let trace = state.decoder.prepare_for_read(&combined).map_err(api_error)?;

    Ok(Json(TraceResponse {
        trace,
        failed_blocks: found.failed_blocks,
    }))
}

async fn list_blocks(State(state): State<AppState>, Path(tenant): Path<String>) -> Json<BlocksResponse> {
    let snapshot = state.db.blocklist().snapshot();
    Json(BlocksResponse {
        blocks: snapshot.metas(&tenant).to_vec(),
        compacted: snapshot.compacted_metas(&tenant).to_vec(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}
