use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use paygrid::security;

use crate::db::{HealthStore, HealthdError};
use crate::metrics;
use crate::scheduler::{self, BatchOptions};

/// Shared application state for the health poller.
pub struct AppState {
    pub db: HealthStore,
    pub probe_client: reqwest::Client,
    /// Bearer secret required on the poll trigger.
    pub poll_secret: Vec<u8>,
    pub defaults: BatchOptions,
    /// Bearer token for the /metrics endpoint.
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
}

/// Optional overrides on the poll trigger; clamped to sane ranges.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOverrides {
    pub batch_size: Option<u32>,
    pub timeout_ms: Option<u64>,
}

fn bearer_authorized(req: &HttpRequest, expected: &[u8]) -> bool {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| security::constant_time_eq(token.as_bytes(), expected))
        .unwrap_or(false)
}

/// POST /poll/facilitators — run one poll batch now.
pub async fn poll_facilitators(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<PollOverrides>>,
) -> HttpResponse {
    if !bearer_authorized(&req, &state.poll_secret) {
        return HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "unauthorized",
            "message": "Valid Bearer token required"
        }));
    }

    let overrides = body.map(|b| b.into_inner()).unwrap_or_default();
    let opts = BatchOptions::new(
        overrides.batch_size.unwrap_or(state.defaults.batch_size),
        overrides
            .timeout_ms
            .unwrap_or(state.defaults.timeout.as_millis() as u64),
        state.defaults.concurrency,
    );

    match scheduler::run_batch(&state.db, &state.probe_client, &opts).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(HealthdError::CursorBusy { job }) => HttpResponse::Conflict().json(serde_json::json!({
            "error": "poll_in_progress",
            "message": format!("a poll batch for '{job}' is already running"),
        })),
        Err(e) => {
            tracing::error!(error = %e, "poll batch failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal_error",
                "message": "poll batch failed",
            }))
        }
    }
}

/// GET /facilitators — discovery read surface: fleet joined with health.
pub async fn list_facilitators(state: web::Data<AppState>) -> HttpResponse {
    match state.db.list_with_health() {
        Ok(rows) => {
            let listed: Vec<_> = rows
                .into_iter()
                .map(|(facilitator, health)| {
                    serde_json::json!({
                        "facilitator": facilitator,
                        "health": health,
                    })
                })
                .collect();
            HttpResponse::Ok().json(serde_json::json!({ "facilitators": listed }))
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list facilitators");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal_error",
                "message": "failed to list facilitators",
            }))
        }
    }
}

/// GET /health — service self-check.
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.db.ping() {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "paygrid-healthd",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "service": "paygrid-healthd",
            "error": "database unreachable",
        })),
    }
}

/// GET /metrics — Prometheus text, bearer-gated.
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            if !bearer_authorized(&req, token) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if !state.public_metrics => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or PAYGRID_PUBLIC_METRICS=true to access /metrics"
            }));
        }
        None => {}
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/poll/facilitators", web::post().to(poll_facilitators))
        .route("/facilitators", web::get().to(list_facilitators))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_endpoint));
}
