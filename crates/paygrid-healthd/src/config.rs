use std::env;

const DEFAULT_PORT: u16 = 4050;
const DEFAULT_DB_PATH: &str = "./paygrid-health.db";
const DEFAULT_BATCH_SIZE: u32 = 10;
const DEFAULT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_RATE_LIMIT_RPM: u64 = 60;

#[derive(Clone)]
pub struct HealthdConfig {
    pub port: u16,
    pub db_path: String,
    /// Bearer secret required on POST /poll/facilitators.
    pub poll_secret: Vec<u8>,
    pub batch_size: u32,
    pub timeout_ms: u64,
    pub concurrency: usize,
    /// When set, a background interval invokes the poll job itself.
    pub poll_interval_secs: Option<u64>,
    pub rate_limit_rpm: u64,
    pub allowed_origins: Vec<String>,
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
}

impl std::fmt::Debug for HealthdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthdConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("poll_secret", &"[REDACTED]")
            .field("batch_size", &self.batch_size)
            .field("timeout_ms", &self.timeout_ms)
            .field("concurrency", &self.concurrency)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .finish()
    }
}

impl HealthdConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_secret = match env::var("POLL_SHARED_SECRET").ok().filter(|s| !s.is_empty()) {
            Some(s) => {
                let bytes = s.into_bytes();
                if bytes.len() < 32 {
                    tracing::warn!(
                        "POLL_SHARED_SECRET is only {} bytes (minimum 32 recommended) — \
                         use `openssl rand -hex 32` to generate a secure secret",
                        bytes.len()
                    );
                }
                bytes
            }
            None => {
                tracing::error!(
                    "POLL_SHARED_SECRET is required. The poll trigger mutates the cursor \
                     and the health registry; it must not be publicly invocable."
                );
                return Err(ConfigError::MissingRequired("POLL_SHARED_SECRET"));
            }
        };

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let batch_size = env::var("POLL_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let timeout_ms = env::var("POLL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let concurrency = env::var("POLL_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CONCURRENCY);

        let poll_interval_secs = env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&secs| secs > 0);

        let rate_limit_rpm = env::var("RATE_LIMIT_RPM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_RPM);

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let metrics_token = env::var("METRICS_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_bytes());

        let public_metrics = env::var("PAYGRID_PUBLIC_METRICS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if metrics_token.is_none() && !public_metrics {
            tracing::warn!("METRICS_TOKEN not set — /metrics will answer 403");
        }

        Ok(Self {
            port,
            db_path,
            poll_secret,
            batch_size,
            timeout_ms,
            concurrency,
            poll_interval_secs,
            rate_limit_rpm,
            allowed_origins,
            metrics_token,
            public_metrics,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),
}
