//! Replay-key derivation and the replay guard.
//!
//! Every payment proof maps to one durable uniqueness token: the transaction
//! hash for `onchain`, the signed nonce scoped to `(from, to, asset)` for
//! `exact`, and the receipt id for `receipt`. A key maps to at most one
//! settlement record, enforced by the ledger's unique index — never by an
//! in-process lock, since concurrent requests may land on independent
//! processes.

use std::fmt;
use std::time::Instant;

use alloy::primitives::{Address, FixedBytes, TxHash};
use dashmap::DashMap;

use crate::payment::PaymentProof;

/// The durable uniqueness token for one payment proof.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplayKey {
    TxHash(TxHash),
    AuthNonce {
        from: Address,
        to: Address,
        asset: String,
        nonce: FixedBytes<32>,
    },
    Receipt(String),
}

impl ReplayKey {
    /// Derive the replay key for a proof. The `exact` nonce is scoped to
    /// `(from, to, asset)` so one payer's nonce space cannot collide with
    /// another's.
    pub fn for_proof(proof: &PaymentProof, asset: &str) -> Self {
        match proof {
            PaymentProof::Exact { authorization } => ReplayKey::AuthNonce {
                from: authorization.from,
                to: authorization.to,
                asset: asset.to_string(),
                nonce: authorization.nonce,
            },
            PaymentProof::Onchain { tx_hash } => ReplayKey::TxHash(*tx_hash),
            PaymentProof::Receipt { receipt_id } => ReplayKey::Receipt(receipt_id.clone()),
        }
    }

    /// The scheme-prefixed string persisted under the unique index.
    pub fn proof_key(&self) -> String {
        match self {
            ReplayKey::TxHash(hash) => format!("tx:{hash}"),
            ReplayKey::AuthNonce {
                from,
                to,
                asset,
                nonce,
            } => format!("auth:{from}:{to}:{asset}:{nonce}"),
            ReplayKey::Receipt(id) => format!("receipt:{id}"),
        }
    }
}

impl fmt::Display for ReplayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.proof_key())
    }
}

/// Replay guard: at-most-once reservation per proof key.
///
/// Implementations must be race-safe: two concurrent reservations of the
/// same key yield exactly one `true`.
pub trait ReplayGuard: Send + Sync {
    /// Atomically reserve the key if it has not been seen.
    /// Returns `true` if this call claimed it.
    fn check_and_reserve(&self, key: &ReplayKey) -> bool;

    /// Whether the key has been reserved.
    fn is_seen(&self, key: &ReplayKey) -> bool;

    /// Drop a reservation. Only safe when the caller knows no settlement
    /// was recorded under the key.
    fn release(&self, key: &ReplayKey);
}

/// In-memory guard backed by DashMap. Single-process only — used by tests
/// and local development; production settlement relies on the ledger's
/// unique index.
pub struct InMemoryReplayGuard {
    seen: DashMap<String, Instant>,
}

impl InMemoryReplayGuard {
    pub fn new() -> Self {
        Self {
            seen: DashMap::new(),
        }
    }
}

impl Default for InMemoryReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayGuard for InMemoryReplayGuard {
    fn check_and_reserve(&self, key: &ReplayKey) -> bool {
        // The entry API is atomic within one process.
        use dashmap::mapref::entry::Entry;
        match self.seen.entry(key.proof_key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    fn is_seen(&self, key: &ReplayKey) -> bool {
        self.seen.contains_key(&key.proof_key())
    }

    fn release(&self, key: &ReplayKey) {
        self.seen.remove(&key.proof_key());
    }
}
