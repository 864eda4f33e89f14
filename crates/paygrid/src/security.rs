//! Shared auth helpers: constant-time comparison and HMAC request signing.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time byte comparison that leaks neither content nor length:
/// both inputs are hashed to fixed-width digests before the `subtle`
/// comparison. Used for bearer-token checks on operational endpoints.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// HMAC-SHA256 over a request body, hex-encoded. Signs machine-to-machine
/// calls between the router and its facilitator.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    alloy::hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC signature over a body. Malformed hex falls through to
/// a comparison against zeros so the timing profile stays flat.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = alloy::hex::decode(signature).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"other"));
        assert!(!constant_time_eq(b"short", b"a longer input"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn hmac_roundtrip_and_tampering() {
        let sig = compute_hmac(b"secret", b"body");
        assert!(verify_hmac(b"secret", b"body", &sig));
        assert!(!verify_hmac(b"other", b"body", &sig));
        assert!(!verify_hmac(b"secret", b"tampered", &sig));
        assert!(!verify_hmac(b"secret", b"body", "zz-not-hex"));
    }
}
