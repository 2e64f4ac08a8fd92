//! HTTP query and monitoring server.
//!
//! Serves the web-presentation collaborator. Queries always run against
//! the live committed index generation — the `CURRENT` pointer is resolved
//! per request, so an in-progress or failed sync run never affects what
//! readers see.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Ranked search with facet filters and pagination |
//! | `GET`  | `/status` | Last-successful-sync monitoring object |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "sort option 'x' is not enabled" } }
//! ```

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::SyncError;
use crate::index::IndexReader;
use crate::pipeline;
use crate::query::{run_query, QueryRequest, SearchPage};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
}

/// Starts the HTTP server. Binds to `[server].bind` and runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", get(handle_search))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "query server listening");

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

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn classify(err: SyncError) -> AppError {
    match err {
        SyncError::Configuration(message) => bad_request(message),
        other => internal(other.to_string()),
    }
}

// ============ GET /search ============

/// Query parameters, collected as raw pairs because facet filters repeat
/// (`?q=falcon&tag=optics&tag=history&collection=History`).
async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<SearchPage>, AppError> {
    let mut request = QueryRequest::default();
    let facet_names = state.config.facets.enabled_names();

    for (name, value) in params {
        match name.as_str() {
            "q" => request.terms = value,
            "scope" => request.scope = value,
            "sort" => request.sort = value,
            "page" => {
                request.page = value
                    .parse()
                    .map_err(|_| bad_request("page must be a positive integer"))?
            }
            "page_len" => {
                request.page_len = Some(
                    value
                        .parse()
                        .map_err(|_| bad_request("page_len must be a positive integer"))?,
                )
            }
            facet if facet_names.contains(&facet) => {
                request.facet_filters.push((facet.to_string(), value));
            }
            other => return Err(bad_request(format!("unknown query parameter '{}'", other))),
        }
    }

    // No terms supplied and no explicit sort: default to the first enabled
    // non-relevance sort.
    if request.terms.trim().is_empty() && request.sort == "relevance" {
        request.sort = state
            .config
            .search
            .sorts
            .iter()
            .find(|s| *s != "relevance")
            .cloned()
            .unwrap_or_else(|| "date_desc".to_string());
    }

    let reader = IndexReader::open_live(&state.config)
        .await
        .map_err(classify)?;

    // No committed generation yet: an empty page, not an error. The web
    // surface stays up regardless of sync state.
    let Some(reader) = reader else {
        return Ok(Json(SearchPage {
            total: 0,
            page: 1,
            page_len: state.config.search.page_len,
            results: Vec::new(),
            facets: Vec::new(),
        }));
    };

    let page = run_query(&state.config, &reader, &request).await;
    reader.close().await;
    page.map(Json).map_err(classify)
}

// ============ GET /status ============

/// Monitoring object: `{"hours_ago": 0.25, "when": "…"}`, or `{}` when no
/// sync has ever completed.
async fn handle_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let when = pipeline::last_sync_time(&state.config)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let body = match when {
        Some(when) => {
            let hours_ago = (chrono::Utc::now() - when).num_seconds() as f64 / 3600.0;
            serde_json::json!({
                "hours_ago": hours_ago,
                "when": when.to_rfc3339(),
            })
        }
        None => serde_json::json!({}),
    };
    Ok(Json(body))
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
