//! EIP-712 verification for `exact`-scheme payment authorizations.
//!
//! The `exact` scheme carries an EIP-3009 `TransferWithAuthorization`
//! message signed off-chain by the payer. Verification is a pure function
//! of (domain, typed fields, signature): build the typed-data hash under
//! the asset's domain, recover the signer, compare against the claimed
//! payer.

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::error::SettleError;
use crate::payment::{decode_hex_signature, ExactAuthorization};
use crate::{ChainConfig, TransferWithAuthorization};

/// Build the EIP-712 domain for the configured chain and asset contract.
pub fn authorization_domain(config: &ChainConfig) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(config.eip712_domain_name.clone())),
        version: Some(std::borrow::Cow::Owned(
            config.eip712_domain_version.clone(),
        )),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(config.asset),
        salt: None,
    }
}

/// Build the typed message from a wire authorization.
pub fn authorization_message(
    auth: &ExactAuthorization,
) -> Result<TransferWithAuthorization, SettleError> {
    let value = auth
        .value
        .parse::<U256>()
        .map_err(|e| SettleError::invalid_input(format!("invalid authorization value: {e}")))?;
    Ok(TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
    })
}

/// Compute the EIP-712 signing hash for an authorization message.
pub fn signing_hash(message: &TransferWithAuthorization, config: &ChainConfig) -> B256 {
    message.eip712_signing_hash(&authorization_domain(config))
}

/// secp256k1 curve order N / 2 — signatures with s above this are malleable
/// (EIP-2) and rejected.
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Verify an authorization signature and return the recovered signer.
///
/// Stateless: the caller compares the result against the claimed payer.
pub fn recover_signer(
    message: &TransferWithAuthorization,
    signature_bytes: &[u8],
    config: &ChainConfig,
) -> Result<Address, SettleError> {
    if signature_bytes.len() != 65 {
        return Err(SettleError::InvalidSignature(format!(
            "signature must be 65 bytes, got {}",
            signature_bytes.len()
        )));
    }

    let sig = Signature::from_raw(signature_bytes)
        .map_err(|e| SettleError::InvalidSignature(format!("unparseable signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(SettleError::InvalidSignature(
            "high-s signature rejected (EIP-2 malleability)".to_string(),
        ));
    }

    let hash = signing_hash(message, config);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| SettleError::InvalidSignature(format!("recovery failed: {e}")))
}

/// Full verification of a wire authorization: parse, recover, compare.
pub fn verify_authorization(
    auth: &ExactAuthorization,
    config: &ChainConfig,
) -> Result<Address, SettleError> {
    let message = authorization_message(auth)?;
    let sig_bytes = decode_hex_signature(&auth.signature)?;
    let recovered = recover_signer(&message, &sig_bytes, config)?;
    if recovered != auth.from {
        return Err(SettleError::InvalidSignature(format!(
            "recovered signer {recovered} does not match payer {}",
            auth.from
        )));
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::FixedBytes;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn signed_auth(signer: &PrivateKeySigner, config: &ChainConfig) -> ExactAuthorization {
        let mut auth = ExactAuthorization {
            from: signer.address(),
            to: Address::new([0x22; 20]),
            value: "10000000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::new([0x07; 32]),
            signature: String::new(),
        };
        let message = authorization_message(&auth).unwrap();
        let sig = signer.sign_hash_sync(&signing_hash(&message, config)).unwrap();
        auth.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));
        auth
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let auth = signed_auth(&signer, &config);
        let recovered = verify_authorization(&auth, &config).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn wrong_claimed_payer_rejected() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let mut auth = signed_auth(&signer, &config);
        auth.from = Address::new([0x99; 20]);
        let err = verify_authorization(&auth, &config).unwrap_err();
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }

    #[test]
    fn tampered_value_changes_recovered_signer() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let mut auth = signed_auth(&signer, &config);
        auth.value = "99999999".to_string();
        assert!(verify_authorization(&auth, &config).is_err());
    }

    #[test]
    fn single_bit_flip_breaks_recovery() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let auth = signed_auth(&signer, &config);
        let message = authorization_message(&auth).unwrap();
        let mut sig_bytes = decode_hex_signature(&auth.signature).unwrap();

        // Flip one bit in r; recovery must fail or land on another address.
        sig_bytes[3] ^= 0x01;
        match recover_signer(&message, &sig_bytes, &config) {
            Ok(addr) => assert_ne!(addr, signer.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn domain_binds_the_chain() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let auth = signed_auth(&signer, &config);

        let mut other_chain = config.clone();
        other_chain.chain_id += 1;
        assert!(verify_authorization(&auth, &other_chain).is_err());
    }

    #[test]
    fn truncated_signature_rejected() {
        let config = ChainConfig::default();
        let signer = PrivateKeySigner::random();
        let auth = signed_auth(&signer, &config);
        let message = authorization_message(&auth).unwrap();
        let err = recover_signer(&message, &[0xde, 0xad], &config).unwrap_err();
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }
}
