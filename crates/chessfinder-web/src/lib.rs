//! JSON HTTP surface over the chessfinder engine.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chessfinder_core::{DownloadJob, Platform, SearchJob, SearchStatus};
use chessfinder_sync::{Engine, EngineConfig, EngineError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chessfinder-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    user: String,
    platform: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAccepted {
    download_request_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStatusBody {
    download_request_id: Uuid,
    start_at: DateTime<Utc>,
    last_downloaded_at: DateTime<Utc>,
    failed: u32,
    succeed: u32,
    done: u32,
    pending: u32,
    total: u32,
}

impl From<DownloadJob> for DownloadStatusBody {
    fn from(job: DownloadJob) -> Self {
        Self {
            download_request_id: job.job_id,
            start_at: job.started_at,
            last_downloaded_at: job.last_progress_at,
            failed: job.failed,
            succeed: job.succeeded,
            done: job.done,
            pending: job.pending,
            total: job.total,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    user: String,
    platform: String,
    board: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchAccepted {
    search_request_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchStatusBody {
    search_request_id: Uuid,
    start_search_at: DateTime<Utc>,
    last_examined_at: DateTime<Utc>,
    examined: u64,
    total: u64,
    matched: Vec<String>,
    status: SearchStatus,
}

impl From<SearchJob> for SearchStatusBody {
    fn from(job: SearchJob) -> Self {
        Self {
            search_request_id: job.search_id,
            start_search_at: job.started_at,
            last_examined_at: job.last_progress_at,
            examined: job.examined_count,
            total: job.total_count,
            matched: job.matched_game_ids,
            status: job.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    msg: String,
}

/// Error response: 422 for business outcomes, 400 for bad requests, 500 otherwise.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn invalid_body() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: "INVALID_BODY",
                msg: "Invalid body".to_string(),
            },
        }
    }

    fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: "VALIDATION_FAILED",
                msg: msg.into(),
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err.kind() {
            ErrorKind::Business => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => {
                error!(%err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let msg = match err.kind() {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => err.to_string(),
        };
        Self {
            status,
            body: ErrorBody {
                code: err.code(),
                msg,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/faster/game",
            post(start_download_handler).get(download_status_handler),
        )
        .route(
            "/api/faster/board",
            post(start_search_handler).get(search_status_handler),
        )
        .with_state(Arc::new(state))
}

/// Serve HTTP and run the queue worker in-process until ctrl-c.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let port = config.web_port;
    let engine = Engine::from_config(config).await?;

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let worker = engine.worker();
    let worker_task = tokio::spawn(async move {
        worker
            .run_until(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = stop_tx.send(true);
    worker_task.await.context("joining worker")??;
    Ok(())
}

fn parse_platform(raw: &str) -> Result<Platform, ApiError> {
    raw.parse()
        .map_err(|err: chessfinder_core::UnknownPlatform| ApiError::validation(err.to_string()))
}

fn required_id(params: &HashMap<String, String>, name: &str) -> Result<Uuid, ApiError> {
    let raw = params
        .get(name)
        .ok_or_else(|| ApiError::validation(format!("Query parameter {name} is missing")))?;
    raw.parse()
        .map_err(|_| ApiError::validation(format!("Query parameter {name} is not a valid id")))
}

async fn start_download_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadAccepted>, ApiError> {
    let Json(request) = body.map_err(|_| ApiError::invalid_body())?;
    let platform = parse_platform(&request.platform)?;
    let started = state.engine.start_download(&request.user, platform).await?;
    Ok(Json(DownloadAccepted {
        download_request_id: started.download_id,
    }))
}

async fn download_status_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<DownloadStatusBody>, ApiError> {
    let id = required_id(&params, "downloadRequestId")?;
    let job = state.engine.download_status(id).await?;
    Ok(Json(job.into()))
}

async fn start_search_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchAccepted>, ApiError> {
    let Json(request) = body.map_err(|_| ApiError::invalid_body())?;
    let platform = parse_platform(&request.platform)?;
    let started = state
        .engine
        .start_search(&request.user, platform, &request.board)
        .await?;
    Ok(Json(SearchAccepted {
        search_request_id: started.search_id,
    }))
}

async fn search_status_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<SearchStatusBody>, ApiError> {
    let id = required_id(&params, "searchRequestId")?;
    let job = state.engine.search_status(id).await?;
    Ok(Json(job.into()))
}
