//! Cursor-driven batch scheduler over the facilitator fleet.
//!
//! One run: lease the cursor, select the next batch, probe concurrently
//! under a cap, upsert every outcome, advance the cursor, release the
//! lease. The cursor advances by the batch length on every non-empty
//! batch; the wrap to zero happens on the following empty fetch, which is
//! reported as a cursor reset rather than an error.

use std::time::{Duration, Instant};

use futures::StreamExt;

use crate::db::{HealthStatus, HealthStore, HealthdError};
use crate::metrics;
use crate::probe;

/// Cursor row name for the facilitator poll job.
pub const POLL_JOB: &str = "facilitator-health-poll";

pub const MIN_BATCH_SIZE: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 50;
pub const MIN_TIMEOUT_MS: u64 = 250;
pub const MAX_TIMEOUT_MS: u64 = 8_000;

/// Effective options for one batch run, clamped to sane ranges.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: u32,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl BatchOptions {
    pub fn new(batch_size: u32, timeout_ms: u64, concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            timeout: Duration::from_millis(timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)),
            concurrency: concurrency.max(1),
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub job: String,
    pub offset: u32,
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub down: usize,
    pub cursor_reset: bool,
    pub next_offset: u32,
    pub elapsed_ms: u64,
}

/// Run one poll batch. Safe under at-most-one-active-instance semantics:
/// the cursor lease is the serialization point, and a concurrent trigger
/// gets [`HealthdError::CursorBusy`].
pub async fn run_batch(
    db: &HealthStore,
    client: &reqwest::Client,
    opts: &BatchOptions,
) -> Result<BatchResult, HealthdError> {
    let started = Instant::now();
    let now = chrono::Utc::now().timestamp();

    // Lease long enough to cover a fully serial worst case, plus slack.
    let lease_secs = (opts.timeout.as_secs() as i64 + 1) * opts.batch_size as i64 + 30;
    let lease = db.acquire_cursor(POLL_JOB, lease_secs, now)?;
    let offset = lease.offset;

    let batch = match db.facilitator_batch(offset, opts.batch_size) {
        Ok(batch) => batch,
        Err(e) => {
            // Free the lease rather than waiting out its expiry.
            let _ = db.complete_cursor(POLL_JOB, offset);
            return Err(e);
        }
    };

    if batch.is_empty() {
        // End of the fleet (or an empty fleet): wrap the cursor.
        db.complete_cursor(POLL_JOB, 0)?;
        let cursor_reset = offset > 0;
        if cursor_reset {
            tracing::info!(job = POLL_JOB, offset, "cursor reset to 0");
        } else {
            tracing::info!(job = POLL_JOB, "no facilitators registered, nothing to poll");
        }
        metrics::BATCH_RUNS.with_label_values(&["empty"]).inc();
        return Ok(BatchResult {
            job: POLL_JOB.to_string(),
            offset,
            probed: 0,
            healthy: 0,
            degraded: 0,
            down: 0,
            cursor_reset,
            next_offset: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    // Concurrent probes, bounded by the cap; each holds its own deadline
    // so one unresponsive facilitator cannot stall the batch.
    let timeout = opts.timeout;
    let batch_len = batch.len();
    let outcomes: Vec<_> = futures::stream::iter(batch)
        .map(|facilitator| {
            let client = client.clone();
            async move {
                let outcome = probe::probe(&client, &facilitator, timeout).await;
                (facilitator.facilitator_id.clone(), outcome)
            }
        })
        .buffer_unordered(opts.concurrency)
        .collect()
        .await;

    let checked_at = chrono::Utc::now().timestamp();
    let (mut healthy, mut degraded, mut down) = (0, 0, 0);
    for (facilitator_id, outcome) in &outcomes {
        match outcome.status {
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Degraded => degraded += 1,
            HealthStatus::Down => down += 1,
        }
        metrics::PROBES
            .with_label_values(&[outcome.status.as_str()])
            .inc();
        if let Err(e) = db.upsert_health(facilitator_id, outcome, checked_at) {
            // Recorded best-effort; the batch keeps going.
            tracing::error!(
                facilitator = %facilitator_id,
                error = %e,
                "failed to persist probe outcome"
            );
        }
    }

    let next_offset = offset + batch_len as u32;
    db.complete_cursor(POLL_JOB, next_offset)?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    metrics::BATCH_RUNS.with_label_values(&["ok"]).inc();
    metrics::BATCH_DURATION.observe(elapsed_ms as f64 / 1000.0);
    tracing::info!(
        job = POLL_JOB,
        offset,
        probed = batch_len,
        healthy,
        degraded,
        down,
        next_offset,
        elapsed_ms,
        "poll batch complete"
    );

    Ok(BatchResult {
        job: POLL_JOB.to_string(),
        offset,
        probed: batch_len,
        healthy,
        degraded,
        down,
        cursor_reset: false,
        next_offset,
        elapsed_ms,
    })
}
