//! SQLite-backed settlement ledger, replay index, spend counters, and
//! policy documents.
//!
//! The ledger is the only persistent state the settlement path touches. Its
//! guarantees come from the database, not from process memory: the replay
//! reservation is an atomic insert against a unique index, and the ledger
//! row plus the tenant's spend increment commit in one transaction so that
//! concurrent settlements against the same budget cannot lose updates.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::SettleError;
use crate::policy::Policy;
use crate::replay::{ReplayGuard, ReplayKey};

/// One append-only ledger row. Created exactly once per proof key and
/// never updated or deleted afterwards.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub proof_key: String,
    pub scheme: String,
    pub amount: String,
    pub asset: String,
    pub payer_address: String,
    pub facilitator_id: String,
    pub tx_hash: Option<String>,
    /// Fresh receipt issued by this settlement, redeemable once via the
    /// `receipt` scheme.
    pub receipt_id: String,
    pub verified_at: i64,
    pub outcome: String,
}

/// The budget bucket a settlement commits its charge against, resolved by
/// the policy enforcer before verification and applied atomically with the
/// ledger write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendBucket {
    pub tenant_id: String,
    pub buyer_id: String,
    /// UTC day, `YYYY-MM-DD`.
    pub day: String,
    pub charge_micros: u64,
}

/// SQLite store for the settlement core.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(path: &str) -> Result<Self, SettleError> {
        let conn = Connection::open(path).map_err(|e| SettleError::Storage(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and local development.
    pub fn open_in_memory() -> Result<Self, SettleError> {
        let conn =
            Connection::open_in_memory().map_err(|e| SettleError::Storage(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SettleError> {
        self.conn
            .lock()
            .map_err(|_| SettleError::Storage("ledger lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), SettleError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS replay_keys (
                proof_key TEXT PRIMARY KEY,
                reserved_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settlements (
                proof_key TEXT PRIMARY KEY,
                scheme TEXT NOT NULL,
                amount TEXT NOT NULL,
                asset TEXT NOT NULL,
                payer_address TEXT NOT NULL,
                facilitator_id TEXT NOT NULL,
                tx_hash TEXT,
                receipt_id TEXT NOT NULL UNIQUE,
                verified_at INTEGER NOT NULL,
                outcome TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tenant_spend (
                tenant_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                day TEXT NOT NULL,
                spent_micros INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, buyer_id, day)
            );

            CREATE TABLE IF NOT EXISTS policy_hits (
                tenant_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policy_hits
                ON policy_hits(tenant_id, buyer_id, at);

            CREATE TABLE IF NOT EXISTS policies (
                policy_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                rules TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policies_tenant
                ON policies(tenant_id, status);
            "#,
        )
        .map_err(SettleError::from)
    }

    /// Commit a settlement: reserve the replay key, append the ledger row,
    /// and apply the spend increment — all in one immediate transaction.
    ///
    /// A duplicate proof key aborts the whole transaction with
    /// [`SettleError::ReplayDetected`], so a losing racer leaves no trace.
    pub fn commit_settlement(
        &self,
        record: &SettlementRecord,
        bucket: Option<&SpendBucket>,
    ) -> Result<(), SettleError> {
        let conn = self.lock()?;
        let tx = rusqlite::Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(SettleError::from)?;

        tx.execute(
            "INSERT INTO replay_keys (proof_key, reserved_at) VALUES (?1, ?2)",
            params![record.proof_key, record.verified_at],
        )?;

        tx.execute(
            r#"
            INSERT INTO settlements
                (proof_key, scheme, amount, asset, payer_address, facilitator_id,
                 tx_hash, receipt_id, verified_at, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.proof_key,
                record.scheme,
                record.amount,
                record.asset,
                record.payer_address,
                record.facilitator_id,
                record.tx_hash,
                record.receipt_id,
                record.verified_at,
                record.outcome,
            ],
        )?;

        if let Some(bucket) = bucket {
            tx.execute(
                r#"
                INSERT INTO tenant_spend (tenant_id, buyer_id, day, spent_micros)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(tenant_id, buyer_id, day)
                    DO UPDATE SET spent_micros = spent_micros + ?4
                "#,
                params![
                    bucket.tenant_id,
                    bucket.buyer_id,
                    bucket.day,
                    bucket.charge_micros as i64
                ],
            )?;
        }

        tx.commit().map_err(SettleError::from)
    }

    /// Look up a settlement by the receipt it issued.
    pub fn find_by_receipt(
        &self,
        receipt_id: &str,
    ) -> Result<Option<SettlementRecord>, SettleError> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            SELECT proof_key, scheme, amount, asset, payer_address, facilitator_id,
                   tx_hash, receipt_id, verified_at, outcome
            FROM settlements WHERE receipt_id = ?1
            "#,
            params![receipt_id],
            row_to_record,
        )
        .optional()
        .map_err(SettleError::from)
    }

    /// Look up a settlement by its proof key.
    pub fn find_by_proof_key(
        &self,
        proof_key: &str,
    ) -> Result<Option<SettlementRecord>, SettleError> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            SELECT proof_key, scheme, amount, asset, payer_address, facilitator_id,
                   tx_hash, receipt_id, verified_at, outcome
            FROM settlements WHERE proof_key = ?1
            "#,
            params![proof_key],
            row_to_record,
        )
        .optional()
        .map_err(SettleError::from)
    }

    /// Running spend for `(tenant, buyer, day)` in micro-USD.
    pub fn daily_spend_micros(
        &self,
        tenant_id: &str,
        buyer_id: &str,
        day: &str,
    ) -> Result<u64, SettleError> {
        let conn = self.lock()?;
        let spent: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(spent_micros), 0) FROM tenant_spend
                 WHERE tenant_id = ?1 AND buyer_id = ?2 AND day = ?3",
                params![tenant_id, buyer_id, day],
                |row| row.get(0),
            )
            .map_err(SettleError::from)?;
        Ok(spent.max(0) as u64)
    }

    /// Record one admitted request in the buyer's rolling rate window.
    pub fn record_policy_hit(
        &self,
        tenant_id: &str,
        buyer_id: &str,
        at: i64,
    ) -> Result<(), SettleError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO policy_hits (tenant_id, buyer_id, at) VALUES (?1, ?2, ?3)",
            params![tenant_id, buyer_id, at],
        )
        .map_err(SettleError::from)?;
        Ok(())
    }

    /// Count admitted requests for the buyer since `since`.
    pub fn count_policy_hits_since(
        &self,
        tenant_id: &str,
        buyer_id: &str,
        since: i64,
    ) -> Result<u32, SettleError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM policy_hits
                 WHERE tenant_id = ?1 AND buyer_id = ?2 AND at >= ?3",
                params![tenant_id, buyer_id, since],
                |row| row.get(0),
            )
            .map_err(SettleError::from)?;
        Ok(count.max(0) as u32)
    }

    /// Purge rate-window rows older than `cutoff`. Returns rows removed.
    pub fn purge_policy_hits(&self, cutoff: i64) -> Result<usize, SettleError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM policy_hits WHERE at < ?1", params![cutoff])
            .map_err(SettleError::from)
    }

    /// Load the tenant's active policy: highest version with status
    /// `active`. Revoked policies are inert.
    pub fn load_active_policy(&self, tenant_id: &str) -> Result<Option<Policy>, SettleError> {
        let conn = self.lock()?;
        let row: Option<(String, String, i64, String)> = conn
            .query_row(
                r#"
                SELECT policy_id, tenant_id, version, rules
                FROM policies
                WHERE tenant_id = ?1 AND status = 'active'
                ORDER BY version DESC
                LIMIT 1
                "#,
                params![tenant_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .map_err(SettleError::from)?;

        match row {
            None => Ok(None),
            Some((policy_id, tenant_id, version, rules)) => Ok(Some(Policy {
                policy_id,
                tenant_id,
                status: crate::policy::PolicyStatus::Active,
                version: version.max(0) as u32,
                rules: serde_json::from_str(&rules)?,
            })),
        }
    }

    /// Insert or replace a policy document. Tenant configuration writes
    /// through here; the settlement path only reads.
    pub fn upsert_policy(&self, policy: &Policy) -> Result<(), SettleError> {
        let rules = serde_json::to_string(&policy.rules)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO policies (policy_id, tenant_id, status, version, rules)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(policy_id) DO UPDATE SET
                tenant_id = ?2, status = ?3, version = ?4, rules = ?5
            "#,
            params![
                policy.policy_id,
                policy.tenant_id,
                policy.status.as_str(),
                policy.version as i64,
                rules
            ],
        )
        .map_err(SettleError::from)?;
        Ok(())
    }

    /// Cheap connectivity check for health endpoints.
    pub fn ping(&self) -> Result<(), SettleError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(SettleError::from)
    }
}

/// The ledger's unique index is the authoritative cross-process replay
/// guard; this impl exposes it behind the same seam as the in-memory guard.
impl ReplayGuard for LedgerStore {
    fn check_and_reserve(&self, key: &ReplayKey) -> bool {
        let Ok(conn) = self.lock() else {
            // A poisoned lock means the reservation cannot be proven;
            // treat the key as already consumed.
            return false;
        };
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO replay_keys (proof_key, reserved_at) VALUES (?1, ?2)",
            params![key.proof_key(), now],
        )
        .is_ok()
    }

    fn is_seen(&self, key: &ReplayKey) -> bool {
        let Ok(conn) = self.lock() else {
            return true;
        };
        conn.query_row(
            "SELECT COUNT(*) FROM replay_keys WHERE proof_key = ?1",
            params![key.proof_key()],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .unwrap_or(true)
    }

    fn release(&self, key: &ReplayKey) {
        let Ok(conn) = self.lock() else {
            return;
        };
        if let Err(e) = conn.execute(
            "DELETE FROM replay_keys WHERE proof_key = ?1",
            params![key.proof_key()],
        ) {
            tracing::error!(key = %key, error = %e, "failed to release replay key");
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SettlementRecord> {
    Ok(SettlementRecord {
        proof_key: row.get(0)?,
        scheme: row.get(1)?,
        amount: row.get(2)?,
        asset: row.get(3)?,
        payer_address: row.get(4)?,
        facilitator_id: row.get(5)?,
        tx_hash: row.get(6)?,
        receipt_id: row.get(7)?,
        verified_at: row.get(8)?,
        outcome: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(proof_key: &str, receipt_id: &str) -> SettlementRecord {
        SettlementRecord {
            proof_key: proof_key.to_string(),
            scheme: "exact".to_string(),
            amount: "10.00".to_string(),
            asset: "USDC".to_string(),
            payer_address: "0x1111111111111111111111111111111111111111".to_string(),
            facilitator_id: "fac-1".to_string(),
            tx_hash: Some("0xabc".to_string()),
            receipt_id: receipt_id.to_string(),
            verified_at: 1_700_000_000,
            outcome: "settled".to_string(),
        }
    }

    #[test]
    fn commit_and_fetch_roundtrip() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.commit_settlement(&record("auth:a", "r-1"), None).unwrap();

        let fetched = store.find_by_receipt("r-1").unwrap().unwrap();
        assert_eq!(fetched.proof_key, "auth:a");
        assert_eq!(fetched.amount, "10.00");
        assert!(store.find_by_receipt("r-unknown").unwrap().is_none());
    }

    #[test]
    fn duplicate_proof_key_is_replay() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.commit_settlement(&record("tx:1", "r-1"), None).unwrap();

        let err = store
            .commit_settlement(&record("tx:1", "r-2"), None)
            .unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");

        // The losing commit left no trace: no row, no receipt.
        assert!(store.find_by_receipt("r-2").unwrap().is_none());
    }

    #[test]
    fn spend_commits_atomically_with_the_ledger_row() {
        let store = LedgerStore::open_in_memory().unwrap();
        let bucket = SpendBucket {
            tenant_id: "t1".to_string(),
            buyer_id: "b1".to_string(),
            day: "2026-08-06".to_string(),
            charge_micros: 9_990_000,
        };
        store
            .commit_settlement(&record("tx:1", "r-1"), Some(&bucket))
            .unwrap();
        assert_eq!(
            store.daily_spend_micros("t1", "b1", "2026-08-06").unwrap(),
            9_990_000
        );

        // A replayed commit must not touch the spend counter.
        let err = store
            .commit_settlement(&record("tx:1", "r-2"), Some(&bucket))
            .unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");
        assert_eq!(
            store.daily_spend_micros("t1", "b1", "2026-08-06").unwrap(),
            9_990_000
        );
    }

    #[test]
    fn spend_accumulates_within_a_day() {
        let store = LedgerStore::open_in_memory().unwrap();
        let bucket = |micros| SpendBucket {
            tenant_id: "t1".to_string(),
            buyer_id: "b1".to_string(),
            day: "2026-08-06".to_string(),
            charge_micros: micros,
        };
        store
            .commit_settlement(&record("tx:1", "r-1"), Some(&bucket(9_990_000)))
            .unwrap();
        store
            .commit_settlement(&record("tx:2", "r-2"), Some(&bucket(10_000)))
            .unwrap();
        assert_eq!(
            store.daily_spend_micros("t1", "b1", "2026-08-06").unwrap(),
            10_000_000
        );
    }

    #[test]
    fn replay_guard_over_sqlite_is_at_most_once() {
        let store = LedgerStore::open_in_memory().unwrap();
        let key = ReplayKey::Receipt("contested".to_string());

        assert!(!store.is_seen(&key));
        assert!(store.check_and_reserve(&key));
        assert!(!store.check_and_reserve(&key));
        assert!(store.is_seen(&key));

        store.release(&key);
        assert!(store.check_and_reserve(&key));
    }

    #[test]
    fn replay_guard_race_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();

        // Two independent store handles, as two processes would hold.
        let a = LedgerStore::open(path).unwrap();
        let b = LedgerStore::open(path).unwrap();
        let key = ReplayKey::Receipt("contested".to_string());

        let wins = [&a, &b]
            .iter()
            .filter(|store| store.check_and_reserve(&key))
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn policy_hits_window_counts() {
        let store = LedgerStore::open_in_memory().unwrap();
        for at in [100, 120, 140] {
            store.record_policy_hit("t1", "b1", at).unwrap();
        }
        assert_eq!(store.count_policy_hits_since("t1", "b1", 110).unwrap(), 2);
        assert_eq!(store.count_policy_hits_since("t1", "b2", 0).unwrap(), 0);

        assert_eq!(store.purge_policy_hits(120).unwrap(), 1);
        assert_eq!(store.count_policy_hits_since("t1", "b1", 0).unwrap(), 2);
    }

    #[test]
    fn active_policy_wins_by_version_and_revocation() {
        use crate::policy::{Policy, PolicyRules, PolicyStatus};

        let store = LedgerStore::open_in_memory().unwrap();
        let mk = |id: &str, version, status| Policy {
            policy_id: id.to_string(),
            tenant_id: "t1".to_string(),
            status,
            version,
            rules: PolicyRules::default(),
        };

        store.upsert_policy(&mk("p1", 1, PolicyStatus::Active)).unwrap();
        store.upsert_policy(&mk("p2", 2, PolicyStatus::Active)).unwrap();
        let active = store.load_active_policy("t1").unwrap().unwrap();
        assert_eq!(active.policy_id, "p2");

        store.upsert_policy(&mk("p2", 2, PolicyStatus::Revoked)).unwrap();
        let active = store.load_active_policy("t1").unwrap().unwrap();
        assert_eq!(active.policy_id, "p1");

        store.upsert_policy(&mk("p1", 1, PolicyStatus::Revoked)).unwrap();
        assert!(store.load_active_policy("t1").unwrap().is_none());
    }
}
