use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygrid_healthd::config::HealthdConfig;
use paygrid_healthd::db::HealthStore;
use paygrid_healthd::routes::{self, AppState};
use paygrid_healthd::scheduler::{self, BatchOptions};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization"])
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

    let config = match HealthdConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(?config, "healthd configuration loaded");

    let db = match HealthStore::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("failed to open health store at {}: {e}", config.db_path);
            std::process::exit(1);
        }
    };

    let probe_client = reqwest::Client::new();
    let defaults = BatchOptions::new(config.batch_size, config.timeout_ms, config.concurrency);

    // Optional self-scheduling: the cursor lease still serializes runs, so
    // an external trigger firing alongside the interval stays safe.
    if let Some(interval_secs) = config.poll_interval_secs {
        let db = db.clone();
        let client = probe_client.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match scheduler::run_batch(&db, &client, &defaults).await {
                    Ok(result) if result.probed > 0 => {
                        tracing::info!(probed = result.probed, "scheduled poll batch ran")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "scheduled poll batch failed"),
                }
            }
        });
        tracing::info!("internal poll schedule: every {interval_secs}s");
    }

    let state = web::Data::new(AppState {
        db,
        probe_client,
        poll_secret: config.poll_secret.clone(),
        defaults,
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

    tracing::info!("paygrid healthd listening on port {port}");
    tracing::info!(
        "poll defaults: batch {} / timeout {}ms / concurrency {}",
        config.batch_size,
        config.timeout_ms,
        config.concurrency
    );
    tracing::info!("  POST http://localhost:{port}/poll/facilitators");
    tracing::info!("  GET  http://localhost:{port}/facilitators");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(16_384))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
