//! Single-facilitator HTTP probe and health classification.
//!
//! A probe is a bounded-deadline GET against the facilitator's declared
//! stats path (or `/health` when unset). Timeouts and network failures are
//! classified, never thrown — one unreachable facilitator must not abort
//! the batch.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::db::{Facilitator, HealthStatus};

/// Stats payload some facilitators expose; both camelCase and snake_case
/// spellings occur in the wild.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacilitatorStats {
    #[serde(rename = "successRate", alias = "success_rate", default)]
    pub success_rate: Option<f64>,
    #[serde(rename = "p95VerifyMs", alias = "p95_verify_ms", default)]
    pub p95_verify_ms: Option<f64>,
    #[serde(rename = "p95SettleMs", alias = "p95_settle_ms", default)]
    pub p95_settle_ms: Option<f64>,
}

/// Outcome of one probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub stats: Option<FacilitatorStats>,
    pub error: Option<String>,
    pub status: HealthStatus,
}

/// Exact classification thresholds.
///
/// - no reachable endpoint → down
/// - `successRate >= 0.98` → healthy
/// - `0.90 <= successRate < 0.98` → degraded
/// - `successRate < 0.90` → down
/// - responded without a stats payload → healthy, latency-only
pub fn classify(ok: bool, stats: Option<&FacilitatorStats>) -> HealthStatus {
    if !ok {
        return HealthStatus::Down;
    }
    match stats.and_then(|s| s.success_rate) {
        None => HealthStatus::Healthy,
        Some(rate) if rate >= 0.98 => HealthStatus::Healthy,
        Some(rate) if rate >= 0.90 => HealthStatus::Degraded,
        Some(_) => HealthStatus::Down,
    }
}

/// Resolve the URL a facilitator is probed at.
pub fn probe_url(facilitator: &Facilitator) -> String {
    let base = facilitator.endpoint.trim_end_matches('/');
    let path = facilitator.stats_path.as_deref().unwrap_or("/health");
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Probe one facilitator. The timeout is a hard deadline: on expiry the
/// in-flight request is dropped and the probe reports a down-leaning
/// outcome instead of hanging the batch.
pub async fn probe(
    client: &reqwest::Client,
    facilitator: &Facilitator,
    timeout: Duration,
) -> ProbeOutcome {
    let url = probe_url(facilitator);
    let start = Instant::now();

    let response = client.get(&url).timeout(timeout).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match response {
        Ok(resp) => {
            let code = resp.status().as_u16();
            if resp.status().is_success() {
                let stats = resp.json::<FacilitatorStats>().await.ok();
                let status = classify(true, stats.as_ref());
                ProbeOutcome {
                    ok: true,
                    latency_ms,
                    status_code: Some(code),
                    stats,
                    error: None,
                    status,
                }
            } else if code == 401 || code == 403 {
                // Protected endpoints still answer: the facilitator is
                // alive, it just will not talk to us.
                ProbeOutcome {
                    ok: true,
                    latency_ms,
                    status_code: Some(code),
                    stats: None,
                    error: None,
                    status: HealthStatus::Healthy,
                }
            } else {
                ProbeOutcome {
                    ok: false,
                    latency_ms,
                    status_code: Some(code),
                    stats: None,
                    error: Some(format!("unexpected status {code}")),
                    status: HealthStatus::Down,
                }
            }
        }
        Err(e) => {
            let error = if e.is_timeout() {
                format!("timeout after {}ms", timeout.as_millis())
            } else {
                format!("request failed: {e}")
            };
            tracing::debug!(
                facilitator = %facilitator.facilitator_id,
                url = %url,
                error = %error,
                "probe failed"
            );
            ProbeOutcome {
                ok: false,
                latency_ms,
                status_code: None,
                stats: None,
                error: Some(error),
                status: HealthStatus::Down,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rate: f64) -> FacilitatorStats {
        FacilitatorStats {
            success_rate: Some(rate),
            ..Default::default()
        }
    }

    #[test]
    fn thresholds_are_exact() {
        assert_eq!(classify(true, Some(&stats(1.0))), HealthStatus::Healthy);
        assert_eq!(classify(true, Some(&stats(0.98))), HealthStatus::Healthy);
        assert_eq!(classify(true, Some(&stats(0.979999))), HealthStatus::Degraded);
        assert_eq!(classify(true, Some(&stats(0.90))), HealthStatus::Degraded);
        assert_eq!(classify(true, Some(&stats(0.899999))), HealthStatus::Down);
        assert_eq!(classify(true, Some(&stats(0.0))), HealthStatus::Down);
    }

    #[test]
    fn responding_without_stats_is_healthy() {
        assert_eq!(classify(true, None), HealthStatus::Healthy);
        assert_eq!(
            classify(true, Some(&FacilitatorStats::default())),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn unreachable_is_down_regardless_of_stats() {
        assert_eq!(classify(false, None), HealthStatus::Down);
        assert_eq!(classify(false, Some(&stats(1.0))), HealthStatus::Down);
    }

    #[test]
    fn stats_accept_both_spellings() {
        let camel: FacilitatorStats = serde_json::from_value(serde_json::json!({
            "successRate": 0.97, "p95VerifyMs": 42.0, "p95SettleMs": 210.0
        }))
        .unwrap();
        assert_eq!(camel.success_rate, Some(0.97));
        assert_eq!(camel.p95_verify_ms, Some(42.0));

        let snake: FacilitatorStats = serde_json::from_value(serde_json::json!({
            "success_rate": 0.85, "p95_verify_ms": 10.0, "p95_settle_ms": 99.0
        }))
        .unwrap();
        assert_eq!(snake.success_rate, Some(0.85));
        assert_eq!(snake.p95_settle_ms, Some(99.0));
    }

    #[test]
    fn probe_url_joins_paths() {
        let mut f = crate::db::Facilitator {
            facilitator_id: "f".to_string(),
            tenant_id: None,
            endpoint: "https://fac.example.com/".to_string(),
            auth_config: None,
            status: "active".to_string(),
            kind: "x402".to_string(),
            stats_path: None,
        };
        assert_eq!(probe_url(&f), "https://fac.example.com/health");

        f.stats_path = Some("/stats".to_string());
        assert_eq!(probe_url(&f), "https://fac.example.com/stats");

        f.stats_path = Some("metrics/summary".to_string());
        assert_eq!(probe_url(&f), "https://fac.example.com/metrics/summary");

        f.stats_path = Some(String::new());
        assert_eq!(probe_url(&f), "https://fac.example.com");
    }

    #[tokio::test]
    async fn unreachable_endpoint_classifies_as_down() {
        let f = crate::db::Facilitator {
            facilitator_id: "f".to_string(),
            tenant_id: None,
            endpoint: "http://127.0.0.1:1".to_string(),
            auth_config: None,
            status: "active".to_string(),
            kind: "x402".to_string(),
            stats_path: None,
        };
        let outcome = probe(&reqwest::Client::new(), &f, Duration::from_millis(500)).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status, HealthStatus::Down);
        assert!(outcome.error.is_some());
        assert_eq!(outcome.status_code, None);
    }
}
