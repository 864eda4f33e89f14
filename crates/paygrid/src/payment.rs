use alloy::primitives::{Address, FixedBytes, TxHash};
use serde::{Deserialize, Serialize};

use crate::error::SettleError;

/// Signed EIP-3009 authorization carried by the `exact` scheme.
///
/// `value` is a base-unit integer string; `signature` is the 65-byte
/// `(r, s, v)` concatenation, hex-encoded with an optional `0x` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: FixedBytes<32>,
    pub signature: String,
}

/// A payment proof: exactly one scheme-specific payload, dispatched by the
/// `scheme` tag. Adding a scheme is a compile-checked extension point —
/// every `match` over this enum is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum PaymentProof {
    /// Gasless transfer authorization signed off-chain by the payer.
    Exact { authorization: ExactAuthorization },
    /// Reference to a transfer the payer already executed on-chain.
    Onchain { tx_hash: TxHash },
    /// A receipt issued by a previous settlement, redeemable once.
    Receipt { receipt_id: String },
}

impl PaymentProof {
    pub fn scheme_name(&self) -> &'static str {
        match self {
            PaymentProof::Exact { .. } => "exact",
            PaymentProof::Onchain { .. } => "onchain",
            PaymentProof::Receipt { .. } => "receipt",
        }
    }

    /// Whether the proof carries a payer signature (the structural
    /// `missingPaymentSignature` policy rule keys off this).
    pub fn has_signature(&self) -> bool {
        match self {
            PaymentProof::Exact { authorization } => !authorization.signature.is_empty(),
            PaymentProof::Onchain { .. } | PaymentProof::Receipt { .. } => false,
        }
    }
}

/// A settlement request as received over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    /// Decimal amount string, e.g. `"10.00"`.
    pub amount: String,
    /// Asset symbol, 2-10 characters.
    pub asset: String,
    pub payment: PaymentProof,
}

impl SettlementRequest {
    /// Validate request shape. Collects every field error rather than
    /// stopping at the first, so callers can fix a request in one pass.
    pub fn validate(&self) -> Result<(), SettleError> {
        let mut details = Vec::new();

        if !is_decimal_amount(&self.amount) {
            details.push(format!("amount '{}' is not a decimal number", self.amount));
        }
        if self.asset.len() < 2 || self.asset.len() > 10 {
            details.push(format!(
                "asset '{}' must be 2-10 characters",
                self.asset
            ));
        } else if !self.asset.chars().all(|c| c.is_ascii_alphanumeric()) {
            details.push(format!("asset '{}' must be alphanumeric", self.asset));
        }

        match &self.payment {
            PaymentProof::Exact { authorization } => {
                if authorization.signature.is_empty() {
                    details.push("authorization.signature is required".to_string());
                } else if decode_hex_signature(&authorization.signature).is_err() {
                    details.push("authorization.signature must be 65 bytes of hex".to_string());
                }
                if authorization.value.parse::<u128>().is_err() {
                    details.push(format!(
                        "authorization.value '{}' is not a base-unit integer",
                        authorization.value
                    ));
                }
                if authorization.valid_before <= authorization.valid_after {
                    details.push("authorization validity window is empty".to_string());
                }
                if authorization.from == Address::ZERO {
                    details.push("authorization.from cannot be the zero address".to_string());
                }
            }
            PaymentProof::Onchain { .. } => {
                // Hash width is enforced by the TxHash type at deserialization.
            }
            PaymentProof::Receipt { receipt_id } => {
                if receipt_id.is_empty() {
                    details.push("receiptId is required".to_string());
                }
            }
        }

        if details.is_empty() {
            Ok(())
        } else {
            Err(SettleError::InvalidInput { details })
        }
    }
}

/// `^\d*\.?\d+$` — digits with at most one decimal point, never trailing.
pub fn is_decimal_amount(s: &str) -> bool {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let int_ok = int_part.chars().all(|c| c.is_ascii_digit());
    match frac_part {
        Some(f) => int_ok && !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()),
        None => int_ok && !int_part.is_empty(),
    }
}

/// Decode a 65-byte hex signature, accepting an optional `0x` prefix.
pub fn decode_hex_signature(sig: &str) -> Result<Vec<u8>, SettleError> {
    let bytes = alloy::hex::decode(sig.strip_prefix("0x").unwrap_or(sig))
        .map_err(|e| SettleError::InvalidSignature(format!("invalid hex signature: {e}")))?;
    if bytes.len() != 65 {
        return Err(SettleError::InvalidSignature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Parse a decimal amount string into integer base units at `decimals`
/// precision. Integer-only arithmetic — no f64 anywhere in the money path.
pub fn amount_to_units(amount: &str, decimals: u32) -> Result<u128, SettleError> {
    if !is_decimal_amount(amount) {
        return Err(SettleError::invalid_input(format!(
            "amount '{amount}' is not a decimal number"
        )));
    }
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if frac_part.len() > decimals as usize {
        return Err(SettleError::invalid_input(format!(
            "amount '{amount}' has more than {decimals} decimal places"
        )));
    }
    let int_units: u128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| SettleError::invalid_input(format!("amount '{amount}' overflows")))?
    };
    let frac_units: u128 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{frac_part:0<width$}", width = decimals as usize);
        padded
            .parse()
            .map_err(|_| SettleError::invalid_input(format!("amount '{amount}' overflows")))?
    };
    int_units
        .checked_mul(10u128.pow(decimals))
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(|| SettleError::invalid_input(format!("amount '{amount}' overflows")))
}

/// Render integer base units back into a decimal amount string.
pub fn units_to_amount(units: u128, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    let int_part = units / scale;
    let frac_part = units % scale;
    if frac_part == 0 {
        format!("{int_part}.{:0<2}", "")
    } else {
        let frac = format!("{frac_part:0>width$}", width = decimals as usize);
        let trimmed = frac.trim_end_matches('0');
        // Keep at least two fractional digits so "10.5" renders as "10.50".
        format!("{int_part}.{:0<2}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_exact() -> PaymentProof {
        PaymentProof::Exact {
            authorization: ExactAuthorization {
                from: Address::new([0x11; 20]),
                to: Address::new([0x22; 20]),
                value: "10000000".to_string(),
                valid_after: 0,
                valid_before: u64::MAX,
                nonce: FixedBytes::new([0x42; 32]),
                signature: format!("0x{}", "ab".repeat(65)),
            },
        }
    }

    fn sample_request(payment: PaymentProof) -> SettlementRequest {
        SettlementRequest {
            tenant_id: Some("tenant-1".to_string()),
            buyer_id: None,
            decision_id: None,
            amount: "10.00".to_string(),
            asset: "USDC".to_string(),
            payment,
        }
    }

    #[test]
    fn valid_exact_request_passes() {
        sample_request(sample_exact()).validate().unwrap();
    }

    #[test]
    fn malformed_amount_rejected() {
        for bad in ["", ".", "1.", "1.2.3", "1,00", "-1", "1e5"] {
            let mut req = sample_request(sample_exact());
            req.amount = bad.to_string();
            let err = req.validate().unwrap_err();
            assert_eq!(err.code(), "INVALID_INPUT", "amount {bad:?}");
        }
    }

    #[test]
    fn leading_dot_amount_is_valid() {
        let mut req = sample_request(sample_exact());
        req.amount = ".50".to_string();
        req.validate().unwrap();
    }

    #[test]
    fn bad_asset_rejected() {
        for bad in ["X", "WAYTOOLONGASSET", "US-D"] {
            let mut req = sample_request(sample_exact());
            req.asset = bad.to_string();
            assert!(req.validate().is_err(), "asset {bad:?}");
        }
    }

    #[test]
    fn short_signature_rejected() {
        let mut req = sample_request(sample_exact());
        if let PaymentProof::Exact {
            ref mut authorization,
        } = req.payment
        {
            authorization.signature = "0xdead".to_string();
        }
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("65 bytes"));
    }

    #[test]
    fn validation_collects_multiple_errors() {
        let mut req = sample_request(sample_exact());
        req.amount = "abc".to_string();
        req.asset = "X".to_string();
        match req.validate().unwrap_err() {
            SettleError::InvalidInput { details } => assert_eq!(details.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn scheme_tag_roundtrips() {
        let req = sample_request(PaymentProof::Onchain {
            tx_hash: TxHash::new([0xab; 32]),
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["payment"]["scheme"], "onchain");
        let back: SettlementRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.payment.scheme_name(), "onchain");
    }

    #[test]
    fn malformed_tx_hash_fails_deserialization() {
        let body = serde_json::json!({
            "amount": "1.00",
            "asset": "USDC",
            "payment": { "scheme": "onchain", "txHash": "invalid-hash" }
        });
        assert!(serde_json::from_value::<SettlementRequest>(body).is_err());
    }

    #[test]
    fn amount_units_are_exact() {
        assert_eq!(amount_to_units("10.00", 6).unwrap(), 10_000_000);
        assert_eq!(amount_to_units("0.01", 6).unwrap(), 10_000);
        assert_eq!(amount_to_units(".5", 6).unwrap(), 500_000);
        assert_eq!(amount_to_units("9.99", 6).unwrap(), 9_990_000);
        assert!(amount_to_units("0.0000001", 6).is_err());
    }

    #[test]
    fn units_render_back_to_decimal() {
        assert_eq!(units_to_amount(10_000_000, 6), "10.00");
        assert_eq!(units_to_amount(10_000, 6), "0.01");
        assert_eq!(units_to_amount(10_500_000, 6), "10.50");
        assert_eq!(units_to_amount(0, 6), "0.00");
    }
}
