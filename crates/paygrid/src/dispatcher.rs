//! Settlement orchestration: policy, scheme verification, replay gate,
//! ledger write.
//!
//! Per proof key the ordering is fixed: verification completes before the
//! replay check, and the replay check is the final gate before the ledger
//! write — a proof that fails verification never consumes its replay slot,
//! and any failure before the commit leaves no persistent trace. Across
//! different proof keys there is no ordering; requests are stateless per
//! invocation and run concurrently across processes.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use serde::Serialize;

use crate::error::SettleError;
use crate::executor::SettlementExecutor;
use crate::ledger::{LedgerStore, SettlementRecord, SpendBucket};
use crate::onchain;
use crate::payment::{amount_to_units, PaymentProof, SettlementRequest};
use crate::policy::{ChargeContext, Decision, PolicyEnforcer};
use crate::replay::ReplayKey;
use crate::{eip712, ChainConfig};

/// Per-request metadata the HTTP layer hands to the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// The payment arrived via the legacy `X-Payment` header.
    pub used_legacy_header: bool,
    /// The price quoted for the resource, when the caller communicated one.
    pub required_amount: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            used_legacy_header: false,
            required_amount: None,
        }
    }

    pub fn with_legacy_header(mut self, used: bool) -> Self {
        self.used_legacy_header = used;
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The receipt half of a successful settlement response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedReceipt {
    pub receipt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub verified_amount: String,
    pub asset: String,
    pub timestamp: i64,
}

/// Uniform settlement result across all schemes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub settled: bool,
    pub scheme: String,
    pub facilitator_id: String,
    pub receipt: IssuedReceipt,
}

/// What scheme dispatch established about the payment.
struct VerifiedPayment {
    payer: String,
    tx_hash: Option<String>,
    facilitator_id: String,
}

/// Routes a settlement request through policy, the scheme-appropriate
/// verifier, the replay gate, and the ledger.
pub struct SettlementDispatcher<P, E> {
    provider: P,
    executor: E,
    ledger: Arc<LedgerStore>,
    policy: PolicyEnforcer,
    config: ChainConfig,
    /// Recipient settlements must pay into.
    treasury: Address,
}

impl<P, E> SettlementDispatcher<P, E>
where
    P: Provider + Send + Sync,
    E: SettlementExecutor,
{
    pub fn new(
        provider: P,
        executor: E,
        ledger: Arc<LedgerStore>,
        config: ChainConfig,
        treasury: Address,
    ) -> Self {
        Self {
            provider,
            executor,
            policy: PolicyEnforcer::new(Arc::clone(&ledger)),
            ledger,
            config,
            treasury,
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Check RPC connectivity by fetching the latest block number.
    pub async fn health_check(&self) -> Result<u64, SettleError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| SettleError::Chain(format!("health check failed: {e}")))
    }

    /// Settle one payment request. At most one ledger row per proof key,
    /// at most one on-chain execution call per request; budget counters
    /// move only on final success.
    pub async fn settle(
        &self,
        req: &SettlementRequest,
        ctx: &RequestContext,
    ) -> Result<SettlementOutcome, SettleError> {
        req.validate()?;

        let amount_micros: u64 = amount_to_units(&req.amount, 6)?
            .try_into()
            .map_err(|_| SettleError::invalid_input("amount is out of range"))?;
        let expected_units = U256::from(amount_to_units(
            &req.amount,
            self.config.asset_decimals,
        )?);

        let bucket = match &req.tenant_id {
            None => None,
            Some(tenant_id) => {
                let charge = ChargeContext {
                    buyer_id: self.buyer_id(req),
                    amount_micros,
                    used_legacy_header: ctx.used_legacy_header,
                    has_payment_signature: req.payment.has_signature(),
                    required_micros: match &ctx.required_amount {
                        Some(amount) => Some(
                            amount_to_units(amount, 6)?
                                .try_into()
                                .map_err(|_| {
                                    SettleError::invalid_input("required amount is out of range")
                                })?,
                        ),
                        None => None,
                    },
                };
                match self.policy.evaluate(tenant_id, &charge)? {
                    Decision::Allow { bucket } => Some(bucket),
                    Decision::Deny { reasons } => {
                        tracing::info!(
                            request_id = %ctx.request_id,
                            tenant = %tenant_id,
                            reasons = ?reasons,
                            "settlement denied by policy"
                        );
                        return Err(SettleError::PolicyDenied { reasons });
                    }
                }
            }
        };

        let verified = self.verify_scheme(req, expected_units).await?;
        self.commit(req, ctx, verified, bucket)
    }

    /// Derive the buyer identity policy accounting runs under: the
    /// explicit buyer id when the caller supplied one, else the payer the
    /// proof claims, else the tenant-wide default bucket.
    fn buyer_id(&self, req: &SettlementRequest) -> String {
        if let Some(buyer) = &req.buyer_id {
            return buyer.clone();
        }
        match &req.payment {
            PaymentProof::Exact { authorization } => {
                format!("{:#x}", authorization.from)
            }
            PaymentProof::Onchain { .. } | PaymentProof::Receipt { .. } => "default".to_string(),
        }
    }

    async fn verify_scheme(
        &self,
        req: &SettlementRequest,
        expected_units: U256,
    ) -> Result<VerifiedPayment, SettleError> {
        match &req.payment {
            PaymentProof::Exact { authorization } => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_err(|e| SettleError::Chain(format!("system time error: {e}")))?
                    .as_secs();
                if now < authorization.valid_after || now >= authorization.valid_before {
                    return Err(SettleError::AuthorizationExpired {
                        valid_after: authorization.valid_after,
                        valid_before: authorization.valid_before,
                        now,
                    });
                }

                if authorization.to != self.treasury {
                    return Err(SettleError::VerificationFailed(format!(
                        "authorization pays {}, expected the treasury {}",
                        authorization.to, self.treasury
                    )));
                }
                let authorized = authorization
                    .value
                    .parse::<U256>()
                    .map_err(|e| SettleError::invalid_input(format!("invalid value: {e}")))?;
                if authorized < expected_units {
                    return Err(SettleError::VerificationFailed(format!(
                        "authorized value {authorized} is below the requested amount \
                         ({expected_units} base units)"
                    )));
                }

                let payer = eip712::verify_authorization(authorization, &self.config)?;

                // Two-phase contract: verified locally, executed by the
                // facilitator, confirmed by the mined receipt it awaits.
                let executed = self
                    .executor
                    .execute(authorization, self.config.asset)
                    .await?;

                Ok(VerifiedPayment {
                    payer: format!("{payer:#x}"),
                    tx_hash: Some(executed.tx_hash),
                    facilitator_id: self.executor.facilitator_id().to_string(),
                })
            }
            PaymentProof::Onchain { tx_hash } => {
                let verified = onchain::verify_transfer(
                    &self.provider,
                    &self.config,
                    *tx_hash,
                    self.treasury,
                    expected_units,
                )
                .await?;
                Ok(VerifiedPayment {
                    payer: format!("{:#x}", verified.payer),
                    tx_hash: Some(format!("{tx_hash}")),
                    facilitator_id: self.executor.facilitator_id().to_string(),
                })
            }
            PaymentProof::Receipt { receipt_id } => {
                let original = self
                    .ledger
                    .find_by_receipt(receipt_id)?
                    .ok_or_else(|| SettleError::NotFound(format!("receipt {receipt_id}")))?;
                if original.asset != req.asset || original.amount != req.amount {
                    return Err(SettleError::VerificationFailed(format!(
                        "receipt covers {} {}, request asks {} {}",
                        original.amount, original.asset, req.amount, req.asset
                    )));
                }
                Ok(VerifiedPayment {
                    payer: original.payer_address,
                    tx_hash: original.tx_hash,
                    facilitator_id: original.facilitator_id,
                })
            }
        }
    }

    /// The replay reservation and the ledger row commit in one
    /// transaction; a duplicate key rolls the whole commit back.
    fn commit(
        &self,
        req: &SettlementRequest,
        ctx: &RequestContext,
        verified: VerifiedPayment,
        bucket: Option<SpendBucket>,
    ) -> Result<SettlementOutcome, SettleError> {
        let key = ReplayKey::for_proof(&req.payment, &req.asset);
        let record = SettlementRecord {
            proof_key: key.proof_key(),
            scheme: req.payment.scheme_name().to_string(),
            amount: req.amount.clone(),
            asset: req.asset.clone(),
            payer_address: verified.payer,
            facilitator_id: verified.facilitator_id,
            tx_hash: verified.tx_hash,
            receipt_id: uuid::Uuid::new_v4().to_string(),
            verified_at: chrono::Utc::now().timestamp(),
            outcome: "settled".to_string(),
        };

        match self.ledger.commit_settlement(&record, bucket.as_ref()) {
            Ok(()) => {}
            Err(SettleError::ReplayDetected) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    key = %key,
                    "replay detected: proof already consumed"
                );
                return Err(SettleError::ReplayDetected);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            request_id = %ctx.request_id,
            scheme = %record.scheme,
            payer = %record.payer_address,
            amount = %record.amount,
            facilitator = %record.facilitator_id,
            tx = ?record.tx_hash,
            "payment settled"
        );

        Ok(SettlementOutcome {
            settled: true,
            scheme: record.scheme,
            facilitator_id: record.facilitator_id,
            receipt: IssuedReceipt {
                receipt_id: record.receipt_id,
                tx_hash: record.tx_hash,
                verified_amount: record.amount,
                asset: record.asset,
                timestamp: record.verified_at,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::FixedBytes;
    use alloy::providers::RootProvider;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    use crate::executor::StaticExecutor;
    use crate::payment::ExactAuthorization;
    use crate::policy::{BudgetRule, Policy, PolicyRules, PolicyStatus};

    const TREASURY: Address = Address::new([0x77; 20]);

    fn dispatcher() -> SettlementDispatcher<RootProvider, StaticExecutor> {
        let provider = RootProvider::<alloy::network::Ethereum>::new_http(
            "http://localhost:1".parse().unwrap(),
        );
        let ledger = Arc::new(LedgerStore::open_in_memory().unwrap());
        SettlementDispatcher::new(
            provider,
            StaticExecutor::new("fac-test", "0xfeedfeed"),
            ledger,
            ChainConfig::default(),
            TREASURY,
        )
    }

    fn signed_request(signer: &PrivateKeySigner, nonce: u8) -> SettlementRequest {
        let config = ChainConfig::default();
        let mut authorization = ExactAuthorization {
            from: signer.address(),
            to: TREASURY,
            value: "10000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::new([nonce; 32]),
            signature: String::new(),
        };
        let message = eip712::authorization_message(&authorization).unwrap();
        let sig = signer
            .sign_hash_sync(&eip712::signing_hash(&message, &config))
            .unwrap();
        authorization.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));

        SettlementRequest {
            tenant_id: None,
            buyer_id: None,
            decision_id: None,
            amount: "10.00".to_string(),
            asset: "USDC".to_string(),
            payment: PaymentProof::Exact { authorization },
        }
    }

    #[tokio::test]
    async fn exact_scheme_settles_and_writes_the_ledger() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let req = signed_request(&signer, 0x01);

        let outcome = d.settle(&req, &RequestContext::new()).await.unwrap();
        assert!(outcome.settled);
        assert_eq!(outcome.scheme, "exact");
        assert_eq!(outcome.facilitator_id, "fac-test");
        assert_eq!(outcome.receipt.tx_hash.as_deref(), Some("0xfeedfeed"));

        let key = ReplayKey::for_proof(&req.payment, &req.asset);
        let row = d.ledger().find_by_proof_key(&key.proof_key()).unwrap().unwrap();
        assert_eq!(row.amount, "10.00");
        assert_eq!(row.payer_address, format!("{:#x}", signer.address()));
    }

    #[tokio::test]
    async fn replaying_the_same_authorization_is_rejected() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let req = signed_request(&signer, 0x02);

        d.settle(&req, &RequestContext::new()).await.unwrap();
        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn issued_receipt_redeems_once() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let first = d
            .settle(&signed_request(&signer, 0x03), &RequestContext::new())
            .await
            .unwrap();

        let redeem = SettlementRequest {
            tenant_id: None,
            buyer_id: None,
            decision_id: None,
            amount: "10.00".to_string(),
            asset: "USDC".to_string(),
            payment: PaymentProof::Receipt {
                receipt_id: first.receipt.receipt_id.clone(),
            },
        };

        let outcome = d.settle(&redeem, &RequestContext::new()).await.unwrap();
        assert!(outcome.settled);
        assert_eq!(outcome.scheme, "receipt");
        // Chain-free re-derivation of the original outcome.
        assert_eq!(outcome.receipt.tx_hash.as_deref(), Some("0xfeedfeed"));
        assert_eq!(outcome.facilitator_id, "fac-test");

        let err = d.settle(&redeem, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");
    }

    #[tokio::test]
    async fn unknown_receipt_is_not_found() {
        let d = dispatcher();
        let req = SettlementRequest {
            tenant_id: None,
            buyer_id: None,
            decision_id: None,
            amount: "1.00".to_string(),
            asset: "USDC".to_string(),
            payment: PaymentProof::Receipt {
                receipt_id: "no-such-receipt".to_string(),
            },
        };
        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn receipt_amount_must_match_the_original() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let first = d
            .settle(&signed_request(&signer, 0x04), &RequestContext::new())
            .await
            .unwrap();

        let redeem = SettlementRequest {
            tenant_id: None,
            buyer_id: None,
            decision_id: None,
            amount: "99.00".to_string(),
            asset: "USDC".to_string(),
            payment: PaymentProof::Receipt {
                receipt_id: first.receipt.receipt_id,
            },
        };
        let err = d.settle(&redeem, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "VERIFICATION_FAILED");
    }

    #[tokio::test]
    async fn expired_authorization_is_rejected_before_execution() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let mut req = signed_request(&signer, 0x05);
        if let PaymentProof::Exact {
            ref mut authorization,
        } = req.payment
        {
            authorization.valid_after = 1;
            authorization.valid_before = 2;
            // Re-sign so only the window is wrong.
            let message = eip712::authorization_message(authorization).unwrap();
            let sig = signer
                .sign_hash_sync(&eip712::signing_hash(&message, d.config()))
                .unwrap();
            authorization.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
        }

        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_EXPIRED");

        // The failed verification consumed nothing: the same nonce still
        // settles once the window is valid.
        let fresh = signed_request(&signer, 0x05);
        d.settle(&fresh, &RequestContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn forged_payer_is_an_invalid_signature() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let mut req = signed_request(&signer, 0x06);
        if let PaymentProof::Exact {
            ref mut authorization,
        } = req.payment
        {
            authorization.from = Address::new([0x99; 20]);
        }
        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn wrong_recipient_fails_verification() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let config = ChainConfig::default();
        let mut authorization = ExactAuthorization {
            from: signer.address(),
            to: Address::new([0x55; 20]),
            value: "10000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::new([0x07; 32]),
            signature: String::new(),
        };
        let message = eip712::authorization_message(&authorization).unwrap();
        let sig = signer
            .sign_hash_sync(&eip712::signing_hash(&message, &config))
            .unwrap();
        authorization.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));

        let req = SettlementRequest {
            tenant_id: None,
            buyer_id: None,
            decision_id: None,
            amount: "10.00".to_string(),
            asset: "USDC".to_string(),
            payment: PaymentProof::Exact { authorization },
        };
        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "VERIFICATION_FAILED");
    }

    #[tokio::test]
    async fn policy_denial_surfaces_with_reasons() {
        let d = dispatcher();
        let mut rules = PolicyRules::default();
        rules.budgets.insert(
            "default".to_string(),
            BudgetRule {
                daily_usd: "1.00".to_string(),
            },
        );
        d.ledger()
            .upsert_policy(&Policy {
                policy_id: "p1".to_string(),
                tenant_id: "tenant-1".to_string(),
                status: PolicyStatus::Active,
                version: 1,
                rules,
            })
            .unwrap();

        let signer = PrivateKeySigner::random();
        let mut req = signed_request(&signer, 0x08);
        req.tenant_id = Some("tenant-1".to_string());
        req.buyer_id = Some("default".to_string());

        let err = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(err.code(), "POLICY_DENIED");
        assert!(err.details().unwrap()[0].contains("daily budget"));
    }

    #[tokio::test]
    async fn budget_moves_only_on_success() {
        let d = dispatcher();
        let signer = PrivateKeySigner::random();
        let mut req = signed_request(&signer, 0x09);
        req.tenant_id = Some("tenant-1".to_string());
        req.buyer_id = Some("agent-1".to_string());

        d.settle(&req, &RequestContext::new()).await.unwrap();
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(
            d.ledger()
                .daily_spend_micros("tenant-1", "agent-1", &day)
                .unwrap(),
            10_000_000
        );

        // The replayed attempt fails and must not double-count.
        let _ = d.settle(&req, &RequestContext::new()).await.unwrap_err();
        assert_eq!(
            d.ledger()
                .daily_spend_micros("tenant-1", "agent-1", &day)
                .unwrap(),
            10_000_000
        );
    }
}
