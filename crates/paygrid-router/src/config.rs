use alloy::primitives::Address;
use std::env;
use url::Url;

use paygrid::ChainConfig;

const DEFAULT_PORT: u16 = 4040;
const DEFAULT_DB_PATH: &str = "./paygrid.db";
const DEFAULT_FACILITATOR_ID: &str = "primary";
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

#[derive(Clone)]
pub struct RouterConfig {
    /// Treasury address settlements must pay into.
    pub treasury: Address,
    /// Remote facilitator executing exact-scheme transfers.
    pub facilitator_url: String,
    pub facilitator_id: String,
    /// HMAC secret for outbound facilitator calls.
    pub facilitator_secret: Option<Vec<u8>>,
    /// HMAC secret expected on inbound /settle calls (None = dev mode).
    pub shared_secret: Option<Vec<u8>>,
    pub db_path: String,
    pub port: u16,
    pub rate_limit_rpm: u64,
    pub allowed_origins: Vec<String>,
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
    pub chain: ChainConfig,
}

impl std::fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterConfig")
            .field("treasury", &self.treasury)
            .field("facilitator_url", &self.facilitator_url)
            .field("facilitator_id", &self.facilitator_id)
            .field(
                "facilitator_secret",
                &self.facilitator_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("db_path", &self.db_path)
            .field("port", &self.port)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .field("chain", &self.chain)
            .finish()
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let treasury_str = env::var("TREASURY_ADDRESS")
            .map_err(|_| ConfigError::MissingRequired("TREASURY_ADDRESS"))?;
        let treasury: Address = treasury_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(treasury_str))?;

        let facilitator_url = env::var("FACILITATOR_URL")
            .map_err(|_| ConfigError::MissingRequired("FACILITATOR_URL"))?;
        Url::parse(&facilitator_url)
            .map_err(|_| ConfigError::InvalidUrl(facilitator_url.clone()))?;

        let facilitator_id =
            env::var("FACILITATOR_ID").unwrap_or_else(|_| DEFAULT_FACILITATOR_ID.to_string());

        let facilitator_secret = env::var("FACILITATOR_SHARED_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_bytes());

        let shared_secret = env::var("ROUTER_SHARED_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_bytes());

        let insecure_no_auth = env::var("PAYGRID_INSECURE_NO_AUTH")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if let Some(ref secret) = shared_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "ROUTER_SHARED_SECRET is only {} bytes (minimum 32 recommended) — \
                     use `openssl rand -hex 32` to generate a secure secret",
                    secret.len()
                );
            }
        } else if insecure_no_auth {
            tracing::warn!(
                "PAYGRID_INSECURE_NO_AUTH=true — /settle will accept UNAUTHENTICATED requests. \
                 DO NOT use this in production!"
            );
        } else {
            tracing::error!(
                "ROUTER_SHARED_SECRET is required. Set it to a secure random value \
                 (e.g. `openssl rand -hex 32`). For local development only, set \
                 PAYGRID_INSECURE_NO_AUTH=true to skip."
            );
            return Err(ConfigError::MissingRequired("ROUTER_SHARED_SECRET"));
        }

        let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

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

        let mut chain = ChainConfig::default();
        if let Ok(rpc_url) = env::var("RPC_URL") {
            if !rpc_url.is_empty() {
                chain.rpc_url = rpc_url;
            }
        }
        if let Some(chain_id) = env::var("CHAIN_ID").ok().and_then(|s| s.parse().ok()) {
            chain.chain_id = chain_id;
            chain.network = format!("eip155:{chain_id}");
        }
        if let Ok(asset_str) = env::var("ASSET_ADDRESS") {
            if !asset_str.is_empty() {
                chain.asset = asset_str
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress(asset_str))?;
            }
        }
        if let Some(depth) = env::var("MIN_CONFIRMATIONS").ok().and_then(|s| s.parse().ok()) {
            chain.min_confirmations = depth;
        }

        Ok(Self {
            treasury,
            facilitator_url,
            facilitator_id,
            facilitator_secret,
            shared_secret,
            db_path,
            port,
            rate_limit_rpm,
            allowed_origins,
            metrics_token,
            public_metrics,
            chain,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}
