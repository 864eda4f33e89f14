use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine;
use serde::Deserialize;

use paygrid::executor::SettlementExecutor;
use paygrid::payment::PaymentProof;
use paygrid::{security, RequestContext, SettleError, SettlementRequest};

use crate::metrics;
use crate::state::AppState;

/// Wire body for POST /settle. The proof may ride in the body or in the
/// base64 `Payment-Signature` header, so it is optional here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleBody {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub buyer_id: Option<String>,
    #[serde(default)]
    pub decision_id: Option<String>,
    pub amount: String,
    pub asset: String,
    #[serde(default)]
    pub payment: Option<PaymentProof>,
}

/// The structured error envelope every failure is rendered into.
fn error_response(err: &SettleError, request_id: &str) -> HttpResponse {
    let mut envelope = serde_json::json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "requestId": request_id,
        }
    });
    if let Some(details) = err.details() {
        envelope["error"]["details"] = serde_json::json!(details);
    }
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(envelope)
}

/// Validate the HMAC header on an incoming /settle call when a shared
/// secret is configured.
fn validate_hmac<E: SettlementExecutor>(
    req: &HttpRequest,
    body_bytes: &[u8],
    state: &AppState<E>,
) -> Result<(), HttpResponse> {
    let Some(ref secret) = state.shared_secret else {
        return Ok(());
    };

    match req
        .headers()
        .get("X-Router-Auth")
        .and_then(|v| v.to_str().ok())
    {
        Some(sig) if security::verify_hmac(secret, body_bytes, sig) => Ok(()),
        Some(_) => {
            tracing::warn!("HMAC verification failed on /settle");
            metrics::AUTH_FAILURES.with_label_values(&["invalid"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication failed"
            })))
        }
        None => {
            tracing::warn!("HMAC header missing on /settle");
            metrics::AUTH_FAILURES.with_label_values(&["missing"]).inc();
            Err(HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication required"
            })))
        }
    }
}

/// Decode a base64 header value into a payment proof.
fn decode_header_proof(value: &str) -> Result<PaymentProof, SettleError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|_| SettleError::invalid_input("payment header is not valid base64"))?;
    serde_json::from_slice(&raw)
        .map_err(|e| SettleError::invalid_input(format!("payment header payload: {e}")))
}

pub async fn settle<E: SettlementExecutor>(
    req: HttpRequest,
    state: web::Data<AppState<E>>,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = validate_hmac(&req, &body, &state) {
        return resp;
    }

    let mut ctx = RequestContext::new();
    let legacy_header = req
        .headers()
        .get("X-Payment")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    ctx.used_legacy_header = legacy_header.is_some();
    ctx.required_amount = req
        .headers()
        .get("X-Required-Amount")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let parsed: SettleBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            let err = SettleError::invalid_input(format!("request body: {e}"));
            metrics::SETTLE_REQUESTS.with_label_values(&["rejected"]).inc();
            metrics::SETTLE_ERRORS.with_label_values(&[err.code()]).inc();
            return error_response(&err, &ctx.request_id);
        }
    };

    // Proof resolution order: body, Payment-Signature header, legacy header.
    let signature_header = req
        .headers()
        .get("Payment-Signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let payment = match parsed.payment {
        Some(p) => Ok(p),
        None => match signature_header.as_deref().or(legacy_header.as_deref()) {
            Some(encoded) => decode_header_proof(encoded),
            None => Err(SettleError::invalid_input("payment proof missing")),
        },
    };
    let payment = match payment {
        Ok(p) => p,
        Err(err) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["rejected"]).inc();
            metrics::SETTLE_ERRORS.with_label_values(&[err.code()]).inc();
            return error_response(&err, &ctx.request_id);
        }
    };

    let request = SettlementRequest {
        tenant_id: parsed.tenant_id,
        buyer_id: parsed.buyer_id,
        decision_id: parsed.decision_id,
        amount: parsed.amount,
        asset: parsed.asset,
        payment,
    };

    let start = std::time::Instant::now();
    match state.dispatcher.settle(&request, &ctx).await {
        Ok(outcome) => {
            let elapsed = start.elapsed().as_secs_f64();
            metrics::SETTLE_REQUESTS.with_label_values(&["settled"]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["settled"])
                .observe(elapsed);
            HttpResponse::Ok().json(outcome)
        }
        Err(err) => {
            let elapsed = start.elapsed().as_secs_f64();
            let result = if err.retryable() { "error" } else { "rejected" };
            metrics::SETTLE_REQUESTS.with_label_values(&[result]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[result])
                .observe(elapsed);
            metrics::SETTLE_ERRORS.with_label_values(&[err.code()]).inc();
            if err.retryable() {
                tracing::error!(request_id = %ctx.request_id, error = %err, "settlement fault");
                // Internal detail stays in the logs.
                return error_response(
                    &SettleError::Storage("settlement failed".to_string()),
                    &ctx.request_id,
                );
            }
            tracing::warn!(
                request_id = %ctx.request_id,
                code = err.code(),
                error = %err,
                "settlement rejected"
            );
            error_response(&err, &ctx.request_id)
        }
    }
}

pub async fn supported<E: SettlementExecutor>(state: web::Data<AppState<E>>) -> HttpResponse {
    let config = state.dispatcher.config();
    HttpResponse::Ok().json(serde_json::json!({
        "schemes": ["exact", "onchain", "receipt"],
        "network": config.network,
        "asset": config.asset,
        "assetSymbol": config.asset_symbol,
    }))
}

pub async fn health<E: SettlementExecutor>(state: web::Data<AppState<E>>) -> HttpResponse {
    let mut response = serde_json::json!({
        "status": "ok",
        "service": "paygrid-router",
        "version": env!("CARGO_PKG_VERSION"),
    });

    if state.dispatcher.ledger().ping().is_err() {
        response["status"] = serde_json::json!("degraded");
        response["ledger_status"] = serde_json::json!("unreachable");
    }

    match tokio::time::timeout(
        std::time::Duration::from_secs(2),
        state.dispatcher.health_check(),
    )
    .await
    {
        Ok(Ok(block)) => {
            response["latestBlock"] = serde_json::json!(block.to_string());
        }
        Ok(Err(_)) | Err(_) => {
            response["status"] = serde_json::json!("degraded");
            response["rpc_status"] = serde_json::json!("unreachable");
        }
    }

    if response["status"] == "degraded" {
        HttpResponse::ServiceUnavailable().json(response)
    } else {
        HttpResponse::Ok().json(response)
    }
}

pub async fn metrics_endpoint<E: SettlementExecutor>(
    req: HttpRequest,
    state: web::Data<AppState<E>>,
) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| security::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);
            if !authorized {
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

/// Register the router's routes for a concrete executor type.
pub fn configure<E: SettlementExecutor + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.route("/settle", web::post().to(settle::<E>))
        .route("/supported", web::get().to(supported::<E>))
        .route("/health", web::get().to(health::<E>))
        .route("/metrics", web::get().to(metrics_endpoint::<E>));
}
