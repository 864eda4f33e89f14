use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use alloy::providers::RootProvider;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygrid::executor::HttpFacilitatorExecutor;
use paygrid::{LedgerStore, SettlementDispatcher};
use paygrid_router::config::RouterConfig;
use paygrid_router::routes;
use paygrid_router::state::AppState;

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec![
                "content-type",
                "authorization",
                "x-router-auth",
                "payment-signature",
            ])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec![
                "content-type",
                "authorization",
                "x-router-auth",
                "payment-signature",
            ])
            .max_age(3600)
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match RouterConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(?config, "router configuration loaded");

    let ledger = match LedgerStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            // The ledger's unique index is the replay guard; without it the
            // router cannot guarantee at-most-once settlement.
            tracing::error!("failed to open ledger at {}: {e}", config.db_path);
            tracing::error!("refusing to start without a persistent replay guard");
            std::process::exit(1);
        }
    };

    // Background sweep of aged rate-window rows.
    {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                let cutoff = chrono::Utc::now().timestamp() - 600;
                match ledger.purge_policy_hits(cutoff) {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(purged, "purged aged rate-window rows")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "rate-window purge failed"),
                }
            }
        });
    }

    let rpc_url = match config.chain.rpc_url.parse() {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("invalid RPC_URL {}: {e}", config.chain.rpc_url);
            std::process::exit(1);
        }
    };
    let provider = RootProvider::<alloy::network::Ethereum>::new_http(rpc_url);

    let mut executor = HttpFacilitatorExecutor::new(
        reqwest::Client::new(),
        &config.facilitator_url,
        &config.facilitator_id,
    );
    if let Some(ref secret) = config.facilitator_secret {
        executor = executor.with_hmac_secret(secret.clone());
    } else {
        tracing::warn!("FACILITATOR_SHARED_SECRET not set — facilitator calls are unsigned");
    }

    let dispatcher = SettlementDispatcher::new(
        provider,
        executor,
        Arc::clone(&ledger),
        config.chain.clone(),
        config.treasury,
    );

    let state = web::Data::new(AppState {
        dispatcher,
        shared_secret: config.shared_secret.clone(),
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
    });

    let governor_conf = match GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
    {
        Some(conf) => conf,
        None => {
            tracing::error!("failed to build rate limiter config");
            std::process::exit(1);
        }
    };

    let port = config.port;
    let origins = config.allowed_origins.clone();

    tracing::info!("paygrid router listening on port {port}");
    tracing::info!("treasury: {}", config.treasury);
    tracing::info!("facilitator: {} ({})", config.facilitator_url, config.facilitator_id);
    tracing::info!("rate limit: {} req/min per IP", config.rate_limit_rpm);
    tracing::info!("  POST http://localhost:{port}/settle");
    tracing::info!("  GET  http://localhost:{port}/supported");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .configure(routes::configure::<HttpFacilitatorExecutor>)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
