//! x402 settlement core for the paygrid router.
//!
//! Implements HTTP 402 machine-to-machine payment settlement: buyers present
//! EIP-3009 signed authorizations, on-chain transaction references, or
//! previously issued receipts; the core verifies the proof, enforces tenant
//! spending policy, guarantees at-most-once processing per proof, and records
//! an append-only ledger entry.
//!
//! # Components
//!
//! - [`dispatcher::SettlementDispatcher`] — orchestrates policy, verification,
//!   replay protection, and the ledger write
//! - [`eip712`] — signature verification for the `exact` (EIP-3009) scheme
//! - [`onchain`] — transfer verification for the `onchain` scheme
//! - [`replay`] — replay-key derivation and the replay guard
//! - [`ledger::LedgerStore`] — SQLite-backed ledger, spend counters, policies
//! - [`policy::PolicyEnforcer`] — budget / rate-limit / structural denials
//! - [`executor`] — the external facilitator contract (on-chain execution)

pub mod constants;
pub mod dispatcher;
pub mod eip712;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod onchain;
pub mod payment;
pub mod policy;
pub mod replay;
pub mod security;

use alloy::sol;

// EIP-3009 transfer authorization. The sol! macro derives SolStruct, which
// provides eip712_signing_hash(); the asset contract is the verifying
// contract of the domain, so it does not appear in the message itself.
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// Minimal ERC-20 surface: enough to decode a settlement transfer from
// transaction calldata.
sol! {
    #[sol(rpc)]
    interface Erc20 {
        function transfer(address to, uint256 value) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
    }
}

// Re-exports
pub use constants::ChainConfig;
pub use dispatcher::{RequestContext, SettlementDispatcher, SettlementOutcome};
pub use error::SettleError;
pub use ledger::{LedgerStore, SettlementRecord, SpendBucket};
pub use payment::{ExactAuthorization, PaymentProof, SettlementRequest};
pub use policy::{Decision, Policy, PolicyEnforcer};
pub use replay::{InMemoryReplayGuard, ReplayGuard, ReplayKey};
