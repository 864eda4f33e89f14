//! Tenant spending policy: structural denials, daily budgets, rate limits.
//!
//! Policies are JSON documents configured by tenants and read-only from the
//! settlement path. Evaluation short-circuits on the first failing rule and
//! returns human-readable reasons; an allow carries the resolved spend
//! bucket so the dispatcher can commit the charge atomically with the
//! ledger write.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SettleError;
use crate::ledger::{LedgerStore, SpendBucket};
use crate::payment::{amount_to_units, units_to_amount};

/// Budget/rate arithmetic runs in micro-USD.
const USD_DECIMALS: u32 = 6;

/// Rolling rate-limit window.
const RATE_WINDOW_SECS: i64 = 60;

/// Buyers without their own budget entry fall back to this key.
const DEFAULT_BUDGET_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Revoked,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub policy_id: String,
    pub tenant_id: String,
    pub status: PolicyStatus,
    pub version: u32,
    pub rules: PolicyRules,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRules {
    /// Per-buyer daily budgets, keyed by buyer id with an optional
    /// `default` fallback. Unmatched buyers with no default are unlimited.
    pub budgets: BTreeMap<String, BudgetRule>,
    /// Per-buyer rate limits over the rolling window.
    pub rpm_limits: BTreeMap<String, RpmRule>,
    pub deny_if: DenyRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRule {
    /// Daily ceiling as a decimal USD string, e.g. `"10.00"`.
    pub daily_usd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpmRule {
    pub rpm: u32,
}

/// Structural request-shape denials, checked before any accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DenyRules {
    pub legacy_x_payment_header: bool,
    pub missing_payment_signature: bool,
    pub amount_below_required: bool,
}

/// The shape of the proposed charge, as seen by policy evaluation.
#[derive(Debug, Clone)]
pub struct ChargeContext {
    pub buyer_id: String,
    pub amount_micros: u64,
    /// The payment arrived via the legacy `X-Payment` header.
    pub used_legacy_header: bool,
    /// The proof carries a payer signature.
    pub has_payment_signature: bool,
    /// The price quoted for the resource, when the caller communicated one.
    pub required_micros: Option<u64>,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow { bucket: SpendBucket },
    Deny { reasons: Vec<String> },
}

/// Evaluates a tenant's active policy against a proposed charge.
pub struct PolicyEnforcer {
    ledger: Arc<LedgerStore>,
}

impl PolicyEnforcer {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Evaluate the tenant's active policy against the charge.
    pub fn evaluate(
        &self,
        tenant_id: &str,
        charge: &ChargeContext,
    ) -> Result<Decision, SettleError> {
        self.evaluate_at(tenant_id, charge, Utc::now())
    }

    /// Evaluation with an injected clock; rules short-circuit in order:
    /// structural denials, daily budget, rate limit.
    pub fn evaluate_at(
        &self,
        tenant_id: &str,
        charge: &ChargeContext,
        now: DateTime<Utc>,
    ) -> Result<Decision, SettleError> {
        let day = now.format("%Y-%m-%d").to_string();
        let bucket = SpendBucket {
            tenant_id: tenant_id.to_string(),
            buyer_id: charge.buyer_id.clone(),
            day: day.clone(),
            charge_micros: charge.amount_micros,
        };

        // No policy on file (or only revoked ones) — nothing to enforce,
        // but the spend is still tracked against the bucket.
        let Some(policy) = self.ledger.load_active_policy(tenant_id)? else {
            return Ok(Decision::Allow { bucket });
        };

        let deny = &policy.rules.deny_if;
        if deny.legacy_x_payment_header && charge.used_legacy_header {
            return Ok(Decision::Deny {
                reasons: vec![
                    "request used the legacy X-Payment header, which this tenant rejects"
                        .to_string(),
                ],
            });
        }
        if deny.missing_payment_signature && !charge.has_payment_signature {
            return Ok(Decision::Deny {
                reasons: vec!["request carries no signed payment authorization".to_string()],
            });
        }
        if deny.amount_below_required {
            if let Some(required) = charge.required_micros {
                if charge.amount_micros < required {
                    return Ok(Decision::Deny {
                        reasons: vec![format!(
                            "amount {} is below the required price {}",
                            units_to_amount(charge.amount_micros as u128, USD_DECIMALS),
                            units_to_amount(required as u128, USD_DECIMALS),
                        )],
                    });
                }
            }
        }

        let budget = policy
            .rules
            .budgets
            .get(&charge.buyer_id)
            .or_else(|| policy.rules.budgets.get(DEFAULT_BUDGET_KEY));
        if let Some(budget) = budget {
            let limit = amount_to_units(&budget.daily_usd, USD_DECIMALS).map_err(|_| {
                SettleError::Storage(format!(
                    "policy {} has malformed dailyUsd '{}'",
                    policy.policy_id, budget.daily_usd
                ))
            })? as u64;
            let spent = self
                .ledger
                .daily_spend_micros(tenant_id, &charge.buyer_id, &day)?;
            if spent.saturating_add(charge.amount_micros) > limit {
                return Ok(Decision::Deny {
                    reasons: vec![format!(
                        "daily budget exceeded: spent {} of {}, charge {} would overrun",
                        units_to_amount(spent as u128, USD_DECIMALS),
                        units_to_amount(limit as u128, USD_DECIMALS),
                        units_to_amount(charge.amount_micros as u128, USD_DECIMALS),
                    )],
                });
            }
        }

        if let Some(rule) = policy.rules.rpm_limits.get(&charge.buyer_id) {
            let since = now.timestamp() - RATE_WINDOW_SECS;
            let recent = self
                .ledger
                .count_policy_hits_since(tenant_id, &charge.buyer_id, since)?;
            if recent >= rule.rpm {
                return Ok(Decision::Deny {
                    reasons: vec![format!(
                        "rate limit exceeded: {recent} requests in the last {RATE_WINDOW_SECS}s \
                         (limit {})",
                        rule.rpm
                    )],
                });
            }
        }

        // Admitted: the request counts against the rolling window.
        self.ledger
            .record_policy_hit(tenant_id, &charge.buyer_id, now.timestamp())?;

        Ok(Decision::Allow { bucket })
    }
}
