//! REST surface.
//!
//! Endpoints:
//! - GET  /health              - liveness plus event loop counters
//! - GET  /media-unit          - paginated media units of the tenant
//! - POST /search              - NDJSON: islands chunk, then summary chunk
//! - GET  /storage?id&raw      - one media unit, or its raw frame
//! - POST /autocomplete        - text generation suggestions
//! - POST /summary             - free-form summary job
//!
//! Everything except `/health` needs `Authorization: Bearer <token>`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use zapdos_islands::SearchHit;

use crate::auth::Authenticator;
use crate::blob::BlobStore;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gateway::GatewayHandle;
use crate::store::MediaStore;
use crate::types::MaskedMediaUnit;

const MAX_PAGE_LIMIT: usize = 100;
const DEFAULT_PAGE_LIMIT: usize = 10;

/// Shared state of every handler.
#[derive(Clone)]
pub struct RestState {
    pub config: Arc<GatewayConfig>,
    pub gateway: GatewayHandle,
    pub store: Arc<dyn MediaStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<dyn Authenticator>,
}

/// Build the router.
pub fn router(state: RestState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media-unit", get(media_units))
        .route("/search", post(search))
        .route("/storage", get(storage))
        .route("/autocomplete", post(autocomplete))
        .route("/summary", post(summary))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `app` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "rest listener started");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("rest listener stopped");
    Ok(())
}

/// Handler failure, rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(m) => ApiError::NotFound(m),
            Error::JobAbandoned { .. } | Error::ShuttingDown => ApiError::Unavailable(e.to_string()),
            other => {
                warn!("request failed: {}", other);
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

/// Tenant resolved from the bearer token.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

impl FromRequestParts<RestState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RestState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;
        state
            .auth
            .verify(token)
            .map(Tenant)
            .ok_or(ApiError::Unauthorized)
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes, what: &str) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest(format!("Invalid {} parameter", what)))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn health(State(state): State<RestState>) -> Json<Value> {
    match state.gateway.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "connections": stats.connections,
            "workers": stats.workers,
            "pending_jobs": stats.pending_jobs,
        })),
        Err(_) => Json(json!({ "status": "stopping" })),
    }
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<String>,
    limit: Option<String>,
}

/// Validate `page >= 1` and `1 <= limit <= 100`.
fn page_params(params: &PageParams) -> std::result::Result<(usize, usize), ApiError> {
    let page = match params.page.as_deref() {
        None => 1,
        Some(raw) => raw.trim().parse::<usize>().ok().filter(|p| *p >= 1).ok_or_else(|| {
            ApiError::BadRequest("Invalid page parameter. Must be a positive integer.".into())
        })?,
    };
    let limit = match params.limit.as_deref() {
        None => DEFAULT_PAGE_LIMIT,
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|l| (1..=MAX_PAGE_LIMIT).contains(l))
            .ok_or_else(|| {
                ApiError::BadRequest(
                    "Invalid limit parameter. Must be a positive integer between 1 and 100.".into(),
                )
            })?,
    };
    Ok((page, limit))
}

async fn media_units(
    State(state): State<RestState>,
    Tenant(tenant_id): Tenant,
    Query(params): Query<PageParams>,
) -> std::result::Result<Json<Value>, ApiError> {
    let (page, limit) = page_params(&params)?;
    let result = state.store.page(&tenant_id, page, limit).await?;

    let total_pages = result.total.div_ceil(limit);
    Ok(Json(json!({
        "items": result.items,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": result.total,
            "totalPages": total_pages,
            "hasNextPage": page < total_pages,
            "hasPrevPage": page > 1,
        }
    })))
}

#[derive(Debug, Deserialize)]
struct StorageParams {
    id: Option<String>,
    raw: Option<String>,
}

async fn storage(
    State(state): State<RestState>,
    Tenant(tenant_id): Tenant,
    Query(params): Query<StorageParams>,
) -> Response {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Bad Request: Missing media unit id").into_response();
    };
    let raw = matches!(params.raw.as_deref(), Some("1") | Some("true"));

    let unit = match state.store.get(&tenant_id, &id).await {
        Ok(unit) => unit,
        Err(e) => return ApiError::from(e).into_response(),
    };

    if !raw {
        return match unit {
            Some(unit) => Json(MaskedMediaUnit::from(&unit)).into_response(),
            None => ApiError::NotFound("Media unit not found".into()).into_response(),
        };
    }

    let Some(unit) = unit else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    if unit.path.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            "Not Found: No raw data for media unit (metadata only)",
        )
            .into_response();
    }
    if let Some(url) = state.blobs.download_url(&unit.path) {
        return Redirect::temporary(&url).into_response();
    }
    match state.blobs.get(&unit.path).await {
        Ok(data) => ([(CONTENT_TYPE, "application/octet-stream")], data).into_response(),
        Err(e) => {
            warn!(media_unit = %id, "failed to read frame: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error: Unable to read file",
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextBody {
    text: String,
}

async fn autocomplete(
    State(state): State<RestState>,
    _tenant: Tenant,
    body: Bytes,
) -> std::result::Result<Json<Value>, ApiError> {
    let body: TextBody = parse_body(&body, "text")?;
    let output = state
        .gateway
        .request(
            state.config.categories.autocomplete.clone(),
            object(json!({ "prompt": body.text })),
        )
        .await?;

    let items: Vec<Value> = output
        .get("generated_texts")
        .and_then(Value::as_array)
        .map(|texts| {
            texts
                .iter()
                .filter_map(Value::as_str)
                .map(|text| json!({ "text": text }))
                .collect()
        })
        .unwrap_or_default();
    Ok(Json(json!({ "items": items })))
}

async fn summary(
    State(state): State<RestState>,
    _tenant: Tenant,
    body: Bytes,
) -> std::result::Result<Json<Value>, ApiError> {
    let body: TextBody = parse_body(&body, "text")?;
    let output = state
        .gateway
        .request(
            state.config.categories.summary.clone(),
            object(json!({ "prompt": body.text })),
        )
        .await?;

    let answer = output
        .get("answer")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::UnexpectedOutput("summary result without answer".into()))?;
    Ok(Json(json!({ "summary": answer })))
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
}

async fn search(
    State(state): State<RestState>,
    Tenant(tenant_id): Tenant,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let SearchBody { query } = parse_body(&body, "query")?;

    let stream = async_stream::stream! {
        match find_hits(&state, &tenant_id, &query).await {
            Ok(hits) => {
                let islands = zapdos_islands::cluster(hits.clone(), state.config.search.island_gap());
                let islands: Vec<_> = islands
                    .iter()
                    .map(|island| {
                        if state.config.search.expose_distance {
                            island.masked_with_distance()
                        } else {
                            island.masked()
                        }
                    })
                    .collect();
                yield ndjson(&json!({ "type": "islands", "islands": islands }));

                match summarize_hits(&state, &query, &hits).await {
                    Ok(Some(summary)) => yield ndjson(&json!({ "type": "summary", "summary": summary })),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("search summary failed: {}", e);
                        yield ndjson(&json!({ "error": "An error occurred while processing the request." }));
                    }
                }
            }
            Err(e) => {
                warn!("search failed: {}", e);
                yield ndjson(&json!({ "error": "Failed to get search results" }));
            }
        }
    };

    Ok(([(CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(stream)).into_response())
}

fn ndjson(value: &Value) -> std::result::Result<Bytes, Infallible> {
    let mut line = value.to_string();
    line.push('\n');
    Ok(Bytes::from(line))
}

/// Embed the query and look up the nearest described frames.
async fn find_hits(state: &RestState, tenant_id: &str, query: &str) -> Result<Vec<SearchHit>> {
    let output = state
        .gateway
        .request(
            state.config.categories.query_embedding.clone(),
            object(json!({ "text": query, "prompt_name": "query" })),
        )
        .await?;

    let embedding: Vec<f32> = output
        .get("embedding")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| Error::UnexpectedOutput("query embedding missing".into()))?;

    state
        .store
        .search(tenant_id, &embedding, state.config.search.limit)
        .await
}

/// Ask the vision model whether the closest frames answer the query.
async fn summarize_hits(state: &RestState, query: &str, hits: &[SearchHit]) -> Result<Option<String>> {
    let mut content = vec![json!({ "type": "text", "text": format!("Do you see any \"{}\"?", query) })];
    content.extend(
        hits.iter()
            .take(state.config.search.summary_images)
            .map(|hit| json!({ "type": "image", "image": hit.path })),
    );
    let payload = object(json!({
        "messages": [
            {
                "role": "system",
                "content": [{
                    "type": "text",
                    "text": "Answer naturally the following query based on the provided context. If there is no relevant information, say there is no relevant context.",
                }],
            },
            { "role": "user", "content": content },
        ]
    }));

    let output = state
        .gateway
        .request(state.config.categories.search_summary.clone(), payload)
        .await?;
    Ok(output
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string))
}
