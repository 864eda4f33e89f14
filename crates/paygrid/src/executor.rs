//! The external facilitator contract for `exact`-scheme execution.
//!
//! A verified authorization is settled by a facilitator that executes the
//! transfer on-chain and returns the mined transaction hash. The executor
//! trait is the typed boundary to that service: the dispatcher verifies,
//! the facilitator executes, the mined receipt is the confirmation. A
//! facilitator rejection is a terminal verification failure; a transport
//! failure is an internal fault the caller may retry.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::SettleError;
use crate::payment::ExactAuthorization;
use crate::security;

/// Result of a facilitator execution: the mined transaction hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub tx_hash: String,
}

/// Executes a verified authorization on-chain.
pub trait SettlementExecutor: Send + Sync {
    /// Submit the transfer and await the mined transaction hash. The
    /// implementation owns the deadline; indefinite blocking is a fault.
    fn execute(
        &self,
        auth: &ExactAuthorization,
        asset: Address,
    ) -> impl Future<Output = Result<ExecutionResult, SettleError>> + Send;

    /// Identifier of the facilitator recorded in the ledger.
    fn facilitator_id(&self) -> &str;
}

/// Wire response from a facilitator's `/execute` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error_reason: Option<String>,
}

/// HTTP executor calling a remote facilitator, optionally signing the
/// request body with a shared-secret HMAC.
pub struct HttpFacilitatorExecutor {
    client: reqwest::Client,
    base_url: String,
    facilitator_id: String,
    hmac_secret: Option<Vec<u8>>,
    deadline: Duration,
}

impl HttpFacilitatorExecutor {
    pub fn new(client: reqwest::Client, base_url: &str, facilitator_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            facilitator_id: facilitator_id.to_string(),
            hmac_secret: None,
            deadline: Duration::from_secs(30),
        }
    }

    pub fn with_hmac_secret(mut self, secret: Vec<u8>) -> Self {
        self.hmac_secret = Some(secret);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

impl SettlementExecutor for HttpFacilitatorExecutor {
    async fn execute(
        &self,
        auth: &ExactAuthorization,
        asset: Address,
    ) -> Result<ExecutionResult, SettleError> {
        let url = format!("{}/execute", self.base_url);
        let body = serde_json::json!({
            "authorization": auth,
            "asset": asset,
        });
        let body_bytes = serde_json::to_vec(&body)?;

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(self.deadline);

        if let Some(ref secret) = self.hmac_secret {
            let sig = security::compute_hmac(secret, &body_bytes);
            request = request.header("X-Facilitator-Auth", sig);
        }

        let resp = request
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| SettleError::Executor(format!("facilitator request failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SettleError::Executor(
                "facilitator authentication failed".to_string(),
            ));
        }

        let parsed: ExecuteResponse = resp
            .json()
            .await
            .map_err(|e| SettleError::Executor(format!("facilitator response parse: {e}")))?;

        if !parsed.success {
            // The facilitator refused or the transfer reverted — the proof
            // cannot settle, and retrying the same authorization will not help.
            return Err(SettleError::VerificationFailed(
                parsed
                    .error_reason
                    .unwrap_or_else(|| "facilitator rejected the transfer".to_string()),
            ));
        }

        let tx_hash = parsed.tx_hash.ok_or_else(|| {
            SettleError::Executor("facilitator reported success without a transaction".to_string())
        })?;

        tracing::info!(
            facilitator = %self.facilitator_id,
            payer = %auth.from,
            tx = %tx_hash,
            "facilitator executed transfer"
        );

        Ok(ExecutionResult { tx_hash })
    }

    fn facilitator_id(&self) -> &str {
        &self.facilitator_id
    }
}

/// Executor returning a fixed transaction hash without touching the
/// network. Backs tests and local development where no facilitator runs.
pub struct StaticExecutor {
    facilitator_id: String,
    tx_hash: String,
}

impl StaticExecutor {
    pub fn new(facilitator_id: &str, tx_hash: &str) -> Self {
        Self {
            facilitator_id: facilitator_id.to_string(),
            tx_hash: tx_hash.to_string(),
        }
    }
}

impl SettlementExecutor for StaticExecutor {
    async fn execute(
        &self,
        _auth: &ExactAuthorization,
        _asset: Address,
    ) -> Result<ExecutionResult, SettleError> {
        Ok(ExecutionResult {
            tx_hash: self.tx_hash.clone(),
        })
    }

    fn facilitator_id(&self) -> &str {
        &self.facilitator_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::FixedBytes;

    fn auth() -> ExactAuthorization {
        ExactAuthorization {
            from: Address::new([0x11; 20]),
            to: Address::new([0x22; 20]),
            value: "1000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::ZERO,
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn static_executor_returns_configured_hash() {
        let exec = StaticExecutor::new("fac-test", "0xfeed");
        let result = exec.execute(&auth(), Address::ZERO).await.unwrap();
        assert_eq!(result.tx_hash, "0xfeed");
        assert_eq!(exec.facilitator_id(), "fac-test");
    }

    #[tokio::test]
    async fn unreachable_facilitator_is_an_internal_fault() {
        let exec = HttpFacilitatorExecutor::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            "fac-down",
        )
        .with_deadline(Duration::from_millis(500));

        let err = exec.execute(&auth(), Address::ZERO).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert!(err.retryable());
    }
}
