//! SQLite store for the facilitator fleet, the health registry, and the
//! poll cursor.
//!
//! Facilitator rows are written by external collaborators (registration
//! surfaces, importers); this service reads them, owns the health registry,
//! and serializes batch polling through a leased cursor row — the SQLite
//! rendition of `SELECT ... FOR UPDATE`.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::probe::ProbeOutcome;

/// Health classification of one facilitator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

/// A registered facilitator. `tenant_id = None` is a globally shared one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facilitator {
    pub facilitator_id: String,
    pub tenant_id: Option<String>,
    pub endpoint: String,
    pub auth_config: Option<serde_json::Value>,
    /// `active` or `inactive`; both are polled.
    pub status: String,
    pub kind: String,
    /// Path probed relative to the endpoint; `/health` when unset.
    pub stats_path: Option<String>,
}

/// One row per facilitator, overwritten wholesale by every probe cycle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorHealth {
    pub facilitator_id: String,
    pub status: HealthStatus,
    pub p95_verify_ms: Option<f64>,
    pub p95_settle_ms: Option<f64>,
    pub success_rate: Option<f64>,
    pub last_checked_at: i64,
    pub last_error: Option<String>,
}

/// The cursor offset granted to one batch run while its lease is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorLease {
    pub offset: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum HealthdError {
    /// Another invocation holds the cursor lease.
    #[error("poll cursor for job '{job}' is held by another run")]
    CursorBusy { job: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// SQLite database wrapper.
#[derive(Clone)]
pub struct HealthStore {
    conn: Arc<Mutex<Connection>>,
}

impl HealthStore {
    pub fn open(path: &str) -> Result<Self, HealthdError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, HealthdError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, HealthdError> {
        self.conn
            .lock()
            .map_err(|_| HealthdError::Internal("database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), HealthdError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS facilitators (
                facilitator_id TEXT PRIMARY KEY,
                tenant_id TEXT,
                endpoint TEXT NOT NULL,
                auth_config TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                kind TEXT NOT NULL DEFAULT 'x402',
                stats_path TEXT
            );

            CREATE TABLE IF NOT EXISTS facilitator_health (
                facilitator_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                p95_verify_ms REAL,
                p95_settle_ms REAL,
                success_rate REAL,
                last_checked_at INTEGER NOT NULL,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS poll_cursors (
                job_name TEXT PRIMARY KEY,
                poll_offset INTEGER NOT NULL DEFAULT 0,
                locked_until INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    /// Register or update a facilitator. Registration surfaces and test
    /// fixtures write through here; the poller only reads.
    pub fn upsert_facilitator(&self, facilitator: &Facilitator) -> Result<(), HealthdError> {
        let auth = match &facilitator.auth_config {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| HealthdError::Internal(format!("auth config: {e}")))?,
            ),
            None => None,
        };
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO facilitators
                (facilitator_id, tenant_id, endpoint, auth_config, status, kind, stats_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(facilitator_id) DO UPDATE SET
                tenant_id = ?2, endpoint = ?3, auth_config = ?4,
                status = ?5, kind = ?6, stats_path = ?7
            "#,
            params![
                facilitator.facilitator_id,
                facilitator.tenant_id,
                facilitator.endpoint,
                auth,
                facilitator.status,
                facilitator.kind,
                facilitator.stats_path,
            ],
        )?;
        Ok(())
    }

    /// Select the next poll batch: active and inactive facilitators in
    /// stable id order, starting at `offset`.
    pub fn facilitator_batch(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Facilitator>, HealthdError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT facilitator_id, tenant_id, endpoint, auth_config, status, kind, stats_path
            FROM facilitators
            WHERE status IN ('active', 'inactive')
            ORDER BY facilitator_id
            LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit, offset], row_to_facilitator)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Acquire the cursor row for `job` under an immediate transaction.
    ///
    /// Grants a lease until `now + lease_secs`; a live lease held by
    /// another invocation refuses with [`HealthdError::CursorBusy`] so a
    /// retried trigger cannot double-process the same batch.
    pub fn acquire_cursor(
        &self,
        job: &str,
        lease_secs: i64,
        now: i64,
    ) -> Result<CursorLease, HealthdError> {
        let conn = self.lock()?;
        let tx = rusqlite::Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO poll_cursors (job_name, poll_offset, locked_until) VALUES (?1, 0, 0)",
            params![job],
        )?;
        let (offset, locked_until): (u32, i64) = tx.query_row(
            "SELECT poll_offset, locked_until FROM poll_cursors WHERE job_name = ?1",
            params![job],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if locked_until > now {
            // Rolls back the open transaction on drop.
            return Err(HealthdError::CursorBusy {
                job: job.to_string(),
            });
        }
        tx.execute(
            "UPDATE poll_cursors SET locked_until = ?2 WHERE job_name = ?1",
            params![job, now + lease_secs],
        )?;
        tx.commit()?;
        Ok(CursorLease { offset })
    }

    /// Advance the cursor and release the lease.
    pub fn complete_cursor(&self, job: &str, next_offset: u32) -> Result<(), HealthdError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE poll_cursors SET poll_offset = ?2, locked_until = 0 WHERE job_name = ?1",
            params![job, next_offset],
        )?;
        Ok(())
    }

    /// Current cursor offset, for read surfaces and tests.
    pub fn cursor_offset(&self, job: &str) -> Result<u32, HealthdError> {
        let conn = self.lock()?;
        let offset = conn
            .query_row(
                "SELECT poll_offset FROM poll_cursors WHERE job_name = ?1",
                params![job],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(offset)
    }

    /// The health registry upsert: idempotent per facilitator id, always
    /// refreshes `last_checked_at`, overwrites every field wholesale,
    /// never deletes rows.
    pub fn upsert_health(
        &self,
        facilitator_id: &str,
        outcome: &ProbeOutcome,
        checked_at: i64,
    ) -> Result<(), HealthdError> {
        let stats = outcome.stats.as_ref();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO facilitator_health
                (facilitator_id, status, p95_verify_ms, p95_settle_ms, success_rate,
                 last_checked_at, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(facilitator_id) DO UPDATE SET
                status = ?2, p95_verify_ms = ?3, p95_settle_ms = ?4,
                success_rate = ?5, last_checked_at = ?6, last_error = ?7
            "#,
            params![
                facilitator_id,
                outcome.status.as_str(),
                stats.and_then(|s| s.p95_verify_ms),
                stats.and_then(|s| s.p95_settle_ms),
                stats.and_then(|s| s.success_rate),
                checked_at,
                outcome.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_health(
        &self,
        facilitator_id: &str,
    ) -> Result<Option<FacilitatorHealth>, HealthdError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT facilitator_id, status, p95_verify_ms, p95_settle_ms, success_rate,
                       last_checked_at, last_error
                FROM facilitator_health WHERE facilitator_id = ?1
                "#,
                params![facilitator_id],
                row_to_health,
            )
            .optional()?;
        Ok(row)
    }

    /// Read surface for discovery: every registered facilitator joined
    /// with its latest health record, if one exists.
    pub fn list_with_health(
        &self,
    ) -> Result<Vec<(Facilitator, Option<FacilitatorHealth>)>, HealthdError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.facilitator_id, f.tenant_id, f.endpoint, f.auth_config, f.status,
                   f.kind, f.stats_path,
                   h.facilitator_id, h.status, h.p95_verify_ms, h.p95_settle_ms,
                   h.success_rate, h.last_checked_at, h.last_error
            FROM facilitators f
            LEFT JOIN facilitator_health h ON h.facilitator_id = f.facilitator_id
            ORDER BY f.facilitator_id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let facilitator = row_to_facilitator(row)?;
                let health = match row.get::<_, Option<String>>(7)? {
                    None => None,
                    Some(id) => Some(FacilitatorHealth {
                        facilitator_id: id,
                        status: parse_status(&row.get::<_, String>(8)?),
                        p95_verify_ms: row.get(9)?,
                        p95_settle_ms: row.get(10)?,
                        success_rate: row.get(11)?,
                        last_checked_at: row.get(12)?,
                        last_error: row.get(13)?,
                    }),
                };
                Ok((facilitator, health))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cheap connectivity check for health endpoints.
    pub fn ping(&self) -> Result<(), HealthdError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn parse_status(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "degraded" => HealthStatus::Degraded,
        _ => HealthStatus::Down,
    }
}

fn row_to_facilitator(row: &rusqlite::Row<'_>) -> rusqlite::Result<Facilitator> {
    let auth: Option<String> = row.get(3)?;
    Ok(Facilitator {
        facilitator_id: row.get(0)?,
        tenant_id: row.get(1)?,
        endpoint: row.get(2)?,
        auth_config: auth.and_then(|raw| serde_json::from_str(&raw).ok()),
        status: row.get(4)?,
        kind: row.get(5)?,
        stats_path: row.get(6)?,
    })
}

fn row_to_health(row: &rusqlite::Row<'_>) -> rusqlite::Result<FacilitatorHealth> {
    Ok(FacilitatorHealth {
        facilitator_id: row.get(0)?,
        status: parse_status(&row.get::<_, String>(1)?),
        p95_verify_ms: row.get(2)?,
        p95_settle_ms: row.get(3)?,
        success_rate: row.get(4)?,
        last_checked_at: row.get(5)?,
        last_error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FacilitatorStats, ProbeOutcome};

    pub(crate) fn facilitator(id: &str) -> Facilitator {
        Facilitator {
            facilitator_id: id.to_string(),
            tenant_id: None,
            endpoint: "http://127.0.0.1:1".to_string(),
            auth_config: None,
            status: "active".to_string(),
            kind: "x402".to_string(),
            stats_path: None,
        }
    }

    fn outcome(status: HealthStatus, rate: Option<f64>, error: Option<&str>) -> ProbeOutcome {
        ProbeOutcome {
            ok: error.is_none(),
            latency_ms: 12,
            status_code: Some(200),
            stats: rate.map(|r| FacilitatorStats {
                success_rate: Some(r),
                p95_verify_ms: Some(40.0),
                p95_settle_ms: Some(180.0),
            }),
            error: error.map(String::from),
            status,
        }
    }

    #[test]
    fn batch_is_stable_ordered_and_offset() {
        let store = HealthStore::open_in_memory().unwrap();
        for id in ["fac-c", "fac-a", "fac-b", "fac-d"] {
            store.upsert_facilitator(&facilitator(id)).unwrap();
        }
        let mut gone = facilitator("fac-gone");
        gone.status = "retired".to_string();
        store.upsert_facilitator(&gone).unwrap();

        let batch = store.facilitator_batch(0, 2).unwrap();
        let ids: Vec<_> = batch.iter().map(|f| f.facilitator_id.as_str()).collect();
        assert_eq!(ids, ["fac-a", "fac-b"]);

        let batch = store.facilitator_batch(2, 2).unwrap();
        let ids: Vec<_> = batch.iter().map(|f| f.facilitator_id.as_str()).collect();
        assert_eq!(ids, ["fac-c", "fac-d"]);

        assert!(store.facilitator_batch(4, 2).unwrap().is_empty());
    }

    #[test]
    fn inactive_facilitators_are_still_polled() {
        let store = HealthStore::open_in_memory().unwrap();
        let mut inactive = facilitator("fac-sleepy");
        inactive.status = "inactive".to_string();
        store.upsert_facilitator(&inactive).unwrap();

        assert_eq!(store.facilitator_batch(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn cursor_lease_excludes_overlapping_runs() {
        let store = HealthStore::open_in_memory().unwrap();

        let lease = store.acquire_cursor("job", 60, 1000).unwrap();
        assert_eq!(lease.offset, 0);

        // Second acquisition while the lease is live refuses.
        match store.acquire_cursor("job", 60, 1010) {
            Err(HealthdError::CursorBusy { job }) => assert_eq!(job, "job"),
            other => panic!("expected CursorBusy, got {other:?}"),
        }

        // After completion the cursor is free and advanced.
        store.complete_cursor("job", 3).unwrap();
        let lease = store.acquire_cursor("job", 60, 1020).unwrap();
        assert_eq!(lease.offset, 3);
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = HealthStore::open_in_memory().unwrap();
        store.acquire_cursor("job", 60, 1000).unwrap();

        // The holder died; past the lease expiry a new run takes over.
        let lease = store.acquire_cursor("job", 60, 1061).unwrap();
        assert_eq!(lease.offset, 0);
    }

    #[test]
    fn health_upsert_overwrites_wholesale() {
        let store = HealthStore::open_in_memory().unwrap();

        store
            .upsert_health("fac-1", &outcome(HealthStatus::Healthy, Some(0.99), None), 100)
            .unwrap();
        let row = store.get_health("fac-1").unwrap().unwrap();
        assert_eq!(row.status, HealthStatus::Healthy);
        assert_eq!(row.success_rate, Some(0.99));
        assert_eq!(row.last_checked_at, 100);

        store
            .upsert_health(
                "fac-1",
                &outcome(HealthStatus::Down, None, Some("timeout after 2000ms")),
                200,
            )
            .unwrap();
        let row = store.get_health("fac-1").unwrap().unwrap();
        assert_eq!(row.status, HealthStatus::Down);
        // Stale stats from the previous cycle do not linger.
        assert_eq!(row.success_rate, None);
        assert_eq!(row.last_checked_at, 200);
        assert_eq!(row.last_error.as_deref(), Some("timeout after 2000ms"));
    }

    #[test]
    fn list_with_health_joins_unprobed_rows() {
        let store = HealthStore::open_in_memory().unwrap();
        store.upsert_facilitator(&facilitator("fac-1")).unwrap();
        store.upsert_facilitator(&facilitator("fac-2")).unwrap();
        store
            .upsert_health("fac-1", &outcome(HealthStatus::Degraded, Some(0.95), None), 50)
            .unwrap();

        let listed = store.list_with_health().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed[0].1.as_ref().map(|h| h.status),
            Some(HealthStatus::Degraded)
        );
        assert!(listed[1].1.is_none());
    }
}
