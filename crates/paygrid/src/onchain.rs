//! On-chain transfer verification for the `onchain` scheme.
//!
//! The buyer claims a transaction hash; verification fetches it from the
//! chain, decodes the ERC-20 `transfer` calldata, and confirms recipient,
//! amount (within tolerance), execution status, and confirmation depth.
//! Every RPC read runs under a hard deadline.

use std::time::Duration;

use alloy::consensus::Transaction as _;
use alloy::network::TransactionResponse as _;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::sol_types::SolCall;

use crate::constants::AMOUNT_TOLERANCE_BPS;
use crate::error::SettleError;
use crate::ChainConfig;
use crate::Erc20;

/// Deadline for each individual RPC read.
const RPC_DEADLINE: Duration = Duration::from_secs(15);

/// Facts established about a verified transfer.
#[derive(Debug, Clone)]
pub struct VerifiedTransfer {
    pub payer: Address,
    pub transferred: U256,
    pub confirmations: u64,
}

/// Decode `transfer(address,uint256)` calldata.
pub(crate) fn decode_transfer(input: &[u8]) -> Result<(Address, U256), SettleError> {
    let call = Erc20::transferCall::abi_decode(input).map_err(|_| {
        SettleError::VerificationFailed(
            "transaction calldata is not an ERC-20 transfer".to_string(),
        )
    })?;
    Ok((call.to, call.value))
}

/// Whether a transferred amount matches the expected amount within the
/// accepted deviation.
pub(crate) fn within_tolerance(transferred: U256, expected: U256) -> bool {
    let diff = if transferred > expected {
        transferred - expected
    } else {
        expected - transferred
    };
    diff * U256::from(10_000u64) <= expected * U256::from(AMOUNT_TOLERANCE_BPS)
}

async fn with_deadline<T, F>(what: &str, fut: F) -> Result<T, SettleError>
where
    F: std::future::Future<Output = Result<T, alloy::transports::TransportError>>,
{
    tokio::time::timeout(RPC_DEADLINE, fut)
        .await
        .map_err(|_| SettleError::Chain(format!("{what} timed out after {RPC_DEADLINE:?}")))?
        .map_err(|e| SettleError::Chain(format!("{what} failed: {e}")))
}

/// Verify that `tx_hash` is a finalized ERC-20 transfer of the configured
/// asset to `expected_to` for (approximately) `expected_units`.
pub async fn verify_transfer<P: Provider>(
    provider: &P,
    config: &ChainConfig,
    tx_hash: TxHash,
    expected_to: Address,
    expected_units: U256,
) -> Result<VerifiedTransfer, SettleError> {
    let tx = with_deadline("get_transaction_by_hash", provider.get_transaction_by_hash(tx_hash))
        .await?
        .ok_or_else(|| {
            SettleError::VerificationFailed(format!("transaction {tx_hash} not found"))
        })?;

    let token = tx.to().ok_or_else(|| {
        SettleError::VerificationFailed("transaction is a contract creation".to_string())
    })?;
    if token != config.asset {
        return Err(SettleError::VerificationFailed(format!(
            "transaction targets {token}, expected the {} contract {}",
            config.asset_symbol, config.asset
        )));
    }

    let (recipient, transferred) = decode_transfer(tx.input())?;
    if recipient != expected_to {
        return Err(SettleError::VerificationFailed(format!(
            "transfer recipient {recipient} does not match expected {expected_to}"
        )));
    }
    if !within_tolerance(transferred, expected_units) {
        return Err(SettleError::VerificationFailed(format!(
            "transferred {transferred} base units does not match expected {expected_units}"
        )));
    }

    let receipt = with_deadline(
        "get_transaction_receipt",
        provider.get_transaction_receipt(tx_hash),
    )
    .await?
    .ok_or_else(|| {
        SettleError::VerificationFailed("transaction has no receipt yet".to_string())
    })?;
    if !receipt.status() {
        return Err(SettleError::VerificationFailed(
            "transaction reverted".to_string(),
        ));
    }

    let mined_at = receipt.block_number.ok_or_else(|| {
        SettleError::VerificationFailed("transaction is not yet mined".to_string())
    })?;
    let latest = with_deadline("get_block_number", provider.get_block_number()).await?;
    let confirmations = latest.saturating_sub(mined_at) + 1;
    if confirmations < config.min_confirmations {
        return Err(SettleError::VerificationFailed(format!(
            "transaction has {confirmations} confirmations, needs {}",
            config.min_confirmations
        )));
    }

    Ok(VerifiedTransfer {
        payer: tx.from(),
        transferred,
        confirmations,
    })
}
