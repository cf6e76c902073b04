//! HTTP trigger for the remote pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/export` | Start a remote archive job for a channel |
//! | `GET`  | `/health` | Liveness probe |
//! | `GET`  | `/status` | Readiness and the last 24h of ledger activity |
//!
//! `POST /export` answers as soon as the job is admitted. Admission only
//! touches the local database; the chat platform is first contacted by the
//! spawned job. The outcome is only
//! visible through the ledger or `GET /status`. When `API_KEY` is set in the
//! environment, the `Authorization` header must carry it (bare or as a
//! bearer token).
//!
//! Errors use one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "channelId is required" } }
//! ```

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::ledger::Readiness;
use crate::pipeline::{Orchestrator, PipelineVariant};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub api_key: Option<String>,
}

/// `arc serve`: bind `[server].bind` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let orchestrator = Orchestrator::from_config(config, pool)?;
    orchestrator.jobs().abandon_running().await?;

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        api_key: crate::mask::secret_env("API_KEY"),
    };
    if state.api_key.is_none() {
        info!("API_KEY not set, /export accepts unauthenticated requests");
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("archive trigger listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/export", post(handle_export))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
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
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

fn authorized(headers: &HeaderMap, api_key: &str) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let presented = v.strip_prefix("Bearer ").unwrap_or(v).trim();
            bool::from(presented.as_bytes().ct_eq(api_key.as_bytes()))
        })
        .unwrap_or(false)
}

// ============ POST /export ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportRequest {
    channel_id: Option<String>,
    guild_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportAccepted {
    message: String,
    channel_id: String,
    guild_id: String,
    job_id: String,
}

async fn handle_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ExportRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExportAccepted>), AppError> {
    if let Some(key) = &state.api_key {
        if !authorized(&headers, key) {
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid Authorization header",
            ));
        }
    }

    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let channel_id = req
        .channel_id
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| bad_request("channelId is required"))?;
    let guild_id = req
        .guild_id
        .filter(|g| !g.trim().is_empty())
        .or_else(|| state.orchestrator.settings().default_guild_id.clone())
        .ok_or_else(|| bad_request("guildId is required"))?;

    let job = state
        .orchestrator
        .begin(&channel_id, Some(&guild_id), PipelineVariant::Remote)
        .await
        .map_err(internal)?;
    let Some(job) = job else {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "busy",
            "an archive job is already running; try again later",
        ));
    };

    let accepted = ExportAccepted {
        message: "Export started".to_string(),
        channel_id,
        guild_id,
        job_id: job.job_id.clone(),
    };

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.execute(job).await;
    });

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    ready: bool,
    recent: Vec<String>,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let readiness = state.orchestrator.readiness().await.map_err(internal)?;
    let recent = state
        .orchestrator
        .ledger()
        .recent_activity(chrono::Duration::hours(24), Utc::now())
        .map_err(internal)?;
    Ok(Json(StatusResponse {
        ready: readiness == Readiness::Ready,
        recent,
    }))
}
