// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable map of request fingerprints to jobs and results.
//!
//! The store is the only shared mutable state in the system. It owns every
//! [`BuildJob`] transition; multi-step transitions run inside SQLite
//! transactions so a crash leaves either the pre- or post-transition state,
//! never a split observation. [`JobStore::claim_pending`] is the single
//! synchronization point between workers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forge_core::{BuildJob, BuildRequest, BuildResult, JobStatus};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted record failed to decode.
    #[error("corrupt record for {fingerprint}: {reason}")]
    CorruptRecord {
        /// Fingerprint of the bad record.
        fingerprint: String,
        /// Decode failure detail.
        reason: String,
    },

    /// A transition was requested from an illegal state.
    #[error("invalid transition for {fingerprint}: {reason}")]
    InvalidTransition {
        /// Fingerprint of the affected job.
        fingerprint: String,
        /// What went wrong.
        reason: String,
    },
}

/// Outcome of an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new PENDING job was created.
    New,
    /// A job for this fingerprint is already PENDING or BUILDING.
    AlreadyInFlight,
    /// A cached result exists; nothing was enqueued.
    AlreadyBuilt,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    fingerprint  TEXT PRIMARY KEY,
    body         TEXT NOT NULL,
    client       TEXT,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS jobs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint    TEXT NOT NULL,
    status         TEXT NOT NULL,
    enqueued_at    TEXT NOT NULL,
    started_at     TEXT,
    finished_at    TEXT,
    worker         TEXT,
    build_cmd      TEXT,
    error_message  TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_fingerprint ON jobs (fingerprint);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE TABLE IF NOT EXISTS results (
    fingerprint       TEXT PRIMARY KEY,
    images            TEXT NOT NULL,
    manifest          TEXT NOT NULL,
    built_at          TEXT NOT NULL,
    duration_seconds  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS counters (
    name   TEXT PRIMARY KEY,
    value  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS metadata_cache (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
";

/// Fingerprint-keyed store of requests, jobs, results, counters, and the
/// advisory metadata cache.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (creating if necessary) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; the connection
        // itself is still transactionally consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Requests ------------------------------------------------------------

    /// Idempotent insert of a canonical request; safe to call twice with the
    /// same fingerprint.
    pub fn put_request(&self, fingerprint: &str, req: &BuildRequest) -> Result<(), StoreError> {
        let body = serde_json::to_string(req).map_err(|e| StoreError::CorruptRecord {
            fingerprint: fingerprint.to_string(),
            reason: e.to_string(),
        })?;
        self.lock().execute(
            "INSERT OR IGNORE INTO requests (fingerprint, body, client, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                fingerprint,
                body,
                req.client.as_deref(),
                req.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Fetch the canonical request for a fingerprint.
    pub fn get_request(&self, fingerprint: &str) -> Result<Option<BuildRequest>, StoreError> {
        let conn = self.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM requests WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            None => Ok(None),
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    fingerprint: fingerprint.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    // -- Results -------------------------------------------------------------

    /// Pure read of the cached result, if any.
    pub fn get_result(&self, fingerprint: &str) -> Result<Option<BuildResult>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT images, manifest, built_at, duration_seconds
                 FROM results WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((images, manifest, built_at, duration_seconds)) = row else {
            return Ok(None);
        };
        let images: Vec<String> =
            serde_json::from_str(&images).map_err(|e| StoreError::CorruptRecord {
                fingerprint: fingerprint.to_string(),
                reason: e.to_string(),
            })?;
        let built_at = parse_ts(fingerprint, &built_at)?;
        Ok(Some(BuildResult {
            fingerprint: fingerprint.to_string(),
            images,
            manifest,
            built_at,
            duration_seconds,
            cache_hit: false,
        }))
    }

    /// Single-writer insert of a build result.
    pub fn put_result(&self, result: &BuildResult) -> Result<(), StoreError> {
        let images = serde_json::to_string(&result.images).map_err(|e| StoreError::CorruptRecord {
            fingerprint: result.fingerprint.clone(),
            reason: e.to_string(),
        })?;
        let inserted = self.lock().execute(
            "INSERT OR IGNORE INTO results
                 (fingerprint, images, manifest, built_at, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.fingerprint,
                images,
                result.manifest,
                result.built_at.to_rfc3339(),
                result.duration_seconds
            ],
        )?;
        if inserted == 0 {
            warn!(fingerprint = %result.fingerprint, "result already present, ignoring rewrite");
        }
        Ok(())
    }

    // -- Jobs ----------------------------------------------------------------

    /// Latest job for a fingerprint, if any.
    pub fn get_job(&self, fingerprint: &str) -> Result<Option<BuildJob>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fingerprint, status, enqueued_at, started_at, finished_at,
                    worker, build_cmd, error_message
             FROM jobs WHERE fingerprint = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let job = stmt
            .query_row(params![fingerprint], row_to_job)
            .optional()?;
        job.map(decode_job).transpose()
    }

    /// Number of PENDING jobs.
    pub fn queue_length(&self) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// 1-based position among PENDING jobs, counting only jobs admitted
    /// earlier. `None` when the fingerprint has no PENDING job.
    pub fn queue_position(&self, fingerprint: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let position: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM jobs earlier
                 WHERE earlier.status = 'pending'
                   AND earlier.id <= (SELECT id FROM jobs
                                      WHERE fingerprint = ?1 AND status = 'pending')",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.filter(|p| *p > 0).map(|p| p as u64))
    }

    /// Admit a job iff no result exists and no job for this fingerprint is
    /// already in flight.
    pub fn enqueue(&self, fingerprint: &str) -> Result<EnqueueOutcome, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let built: i64 = tx.query_row(
            "SELECT COUNT(*) FROM results WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        if built > 0 {
            return Ok(EnqueueOutcome::AlreadyBuilt);
        }

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE fingerprint = ?1 AND status IN ('pending', 'building')",
            params![fingerprint],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Ok(EnqueueOutcome::AlreadyInFlight);
        }

        tx.execute(
            "INSERT INTO jobs (fingerprint, status, enqueued_at) VALUES (?1, 'pending', ?2)",
            params![fingerprint, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(EnqueueOutcome::New)
    }

    /// Atomically claim the oldest PENDING job for `worker`.
    ///
    /// Serializable: two concurrent callers never obtain the same job.
    pub fn claim_pending(&self, worker: &str) -> Result<Option<BuildJob>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let oldest = tx
            .query_row(
                "SELECT id FROM jobs WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(id) = oldest else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'building', started_at = ?1, worker = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), worker, id],
        )?;

        let job = tx.query_row(
            "SELECT id, fingerprint, status, enqueued_at, started_at, finished_at,
                    worker, build_cmd, error_message
             FROM jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )?;
        tx.commit()?;
        decode_job(job).map(Some)
    }

    /// Terminal transition to COMPLETED, stamping the finish time and the
    /// build command line.
    pub fn complete(&self, fingerprint: &str, build_cmd: &str) -> Result<(), StoreError> {
        self.finish(fingerprint, JobStatus::Completed, Some(build_cmd), None)
    }

    /// Terminal transition to FAILED with a phase-tagged message.
    pub fn fail(&self, fingerprint: &str, error_message: &str) -> Result<(), StoreError> {
        self.finish(fingerprint, JobStatus::Failed, None, Some(error_message))
    }

    fn finish(
        &self,
        fingerprint: &str,
        status: JobStatus,
        build_cmd: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let updated = self.lock().execute(
            "UPDATE jobs
             SET status = ?1, finished_at = ?2,
                 build_cmd = COALESCE(?3, build_cmd),
                 error_message = ?4
             WHERE fingerprint = ?5 AND status = 'building'",
            params![
                status.as_str(),
                Utc::now().to_rfc3339(),
                build_cmd,
                error_message,
                fingerprint
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::InvalidTransition {
                fingerprint: fingerprint.to_string(),
                reason: format!("no BUILDING job to mark {status}"),
            });
        }
        Ok(())
    }

    /// Move a stale BUILDING job back to PENDING (crash recovery).
    pub fn requeue_building(&self, fingerprint: &str) -> Result<(), StoreError> {
        let updated = self.lock().execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL, worker = NULL
             WHERE fingerprint = ?1 AND status = 'building'",
            params![fingerprint],
        )?;
        if updated == 0 {
            return Err(StoreError::InvalidTransition {
                fingerprint: fingerprint.to_string(),
                reason: "no BUILDING job to requeue".into(),
            });
        }
        Ok(())
    }

    /// All jobs currently marked BUILDING; consulted by the startup
    /// recovery sweep.
    pub fn building_jobs(&self) -> Result<Vec<BuildJob>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fingerprint, status, enqueued_at, started_at, finished_at,
                    worker, build_cmd, error_message
             FROM jobs WHERE status = 'building' ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_job).collect()
    }

    /// Delete the result and job history for a fingerprint. The caller is
    /// responsible for removing artifact blobs on disk.
    pub fn expire(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM results WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        tx.execute(
            "DELETE FROM jobs WHERE fingerprint = ?1 AND status IN ('completed', 'failed')",
            params![fingerprint],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fingerprints whose terminal state has outlived its TTL: results older
    /// than `build_ttl`, failed jobs older than `failure_ttl`.
    pub fn expired_fingerprints(
        &self,
        build_ttl: Duration,
        failure_ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let success_cutoff = now - chrono_duration(build_ttl);
        let failure_cutoff = now - chrono_duration(failure_ttl);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT fingerprint FROM results WHERE built_at < ?1
             UNION
             SELECT fingerprint FROM jobs WHERE status = 'failed' AND finished_at < ?2",
        )?;
        let rows = stmt
            .query_map(
                params![success_cutoff.to_rfc3339(), failure_cutoff.to_rfc3339()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Counters ------------------------------------------------------------

    /// Add one to a named event counter.
    pub fn increment_counter(&self, name: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        Ok(())
    }

    /// Snapshot of all counters.
    pub fn counters(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name, value FROM counters ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }

    // -- Metadata cache --------------------------------------------------

    /// Read a cached value; expired entries read as absent.
    pub fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT value, expires_at FROM metadata_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((value, expires_at)) = row else {
            return Ok(None);
        };
        let expires_at = parse_ts(key, &expires_at)?;
        if expires_at < Utc::now() {
            return Ok(None);
        }
        serde_json::from_str(&value)
            .map(Some)
            .map_err(|e| StoreError::CorruptRecord {
                fingerprint: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Upsert a cached value with a time-to-live.
    pub fn cache_put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = Utc::now() + chrono_duration(ttl);
        self.lock().execute(
            "INSERT INTO metadata_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value.to_string(), expires_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Raw job row before timestamp parsing.
struct JobRow {
    id: i64,
    fingerprint: String,
    status: String,
    enqueued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    worker: Option<String>,
    build_cmd: Option<String>,
    error_message: Option<String>,
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        status: row.get(2)?,
        enqueued_at: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        worker: row.get(6)?,
        build_cmd: row.get(7)?,
        error_message: row.get(8)?,
    })
}

fn decode_job(row: JobRow) -> Result<BuildJob, StoreError> {
    let status = JobStatus::parse(&row.status).ok_or_else(|| StoreError::CorruptRecord {
        fingerprint: row.fingerprint.clone(),
        reason: format!("unknown status '{}'", row.status),
    })?;
    Ok(BuildJob {
        queue_seq: row.id,
        status,
        enqueued_at: parse_ts(&row.fingerprint, &row.enqueued_at)?,
        started_at: row
            .started_at
            .as_deref()
            .map(|s| parse_ts(&row.fingerprint, s))
            .transpose()?,
        finished_at: row
            .finished_at
            .as_deref()
            .map(|s| parse_ts(&row.fingerprint, s))
            .transpose()?,
        fingerprint: row.fingerprint,
        worker: row.worker,
        build_cmd: row.build_cmd,
        error_message: row.error_message,
    })
}

fn parse_ts(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord {
            fingerprint: key.to_string(),
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn store() -> JobStore {
        JobStore::open_in_memory().unwrap()
    }

    fn request(fingerprint_seed: &str) -> BuildRequest {
        BuildRequest {
            distribution: "openwrt".into(),
            version: "24.10.0".into(),
            target: "ath79/generic".into(),
            profile: fingerprint_seed.into(),
            packages: vec!["luci".into()],
            packages_versions: BTreeMap::new(),
            diff_packages: false,
            skip_package_resolution: false,
            defaults: None,
            rootfs_size_mb: None,
            repositories: vec![],
            repository_keys: vec![],
            client: Some("test".into()),
            created_at: Utc::now(),
        }
    }

    fn result(fingerprint: &str) -> BuildResult {
        BuildResult {
            fingerprint: fingerprint.into(),
            images: vec!["sysupgrade.bin".into()],
            manifest: "luci - git-24.086\n".into(),
            built_at: Utc::now(),
            duration_seconds: 42,
            cache_hit: false,
        }
    }

    #[test]
    fn put_request_is_idempotent() {
        let store = store();
        let req = request("a");
        store.put_request("fp-a", &req).unwrap();
        store.put_request("fp-a", &req).unwrap();
        let back = store.get_request("fp-a").unwrap().unwrap();
        assert_eq!(back.profile, "a");
    }

    #[test]
    fn enqueue_creates_once_then_reports_in_flight() {
        let store = store();
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::New);
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::AlreadyInFlight);
        assert_eq!(store.queue_length().unwrap(), 1);
    }

    #[test]
    fn enqueue_refuses_when_result_exists() {
        let store = store();
        store.put_result(&result("fp")).unwrap();
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::AlreadyBuilt);
        assert_eq!(store.queue_length().unwrap(), 0);
    }

    #[test]
    fn claim_takes_oldest_first() {
        let store = store();
        store.enqueue("first").unwrap();
        store.enqueue("second").unwrap();

        let job = store.claim_pending("w0").unwrap().unwrap();
        assert_eq!(job.fingerprint, "first");
        assert_eq!(job.status, JobStatus::Building);
        assert_eq!(job.worker.as_deref(), Some("w0"));
        assert!(job.started_at.is_some());

        let job = store.claim_pending("w1").unwrap().unwrap();
        assert_eq!(job.fingerprint, "second");

        assert!(store.claim_pending("w2").unwrap().is_none());
    }

    #[test]
    fn claimed_job_is_not_claimable_again() {
        let store = store();
        store.enqueue("fp").unwrap();
        assert!(store.claim_pending("w0").unwrap().is_some());
        assert!(store.claim_pending("w1").unwrap().is_none());
        // Still in flight, so admission dedupes.
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::AlreadyInFlight);
    }

    #[test]
    fn queue_position_counts_earlier_pending_only() {
        let store = store();
        store.enqueue("a").unwrap();
        store.enqueue("b").unwrap();
        store.enqueue("c").unwrap();
        assert_eq!(store.queue_position("a").unwrap(), Some(1));
        assert_eq!(store.queue_position("c").unwrap(), Some(3));

        store.claim_pending("w0").unwrap();
        assert_eq!(store.queue_position("a").unwrap(), None);
        assert_eq!(store.queue_position("b").unwrap(), Some(1));
        assert_eq!(store.queue_position("c").unwrap(), Some(2));
        assert_eq!(store.queue_position("zzz").unwrap(), None);
    }

    #[test]
    fn complete_stamps_finish_and_command() {
        let store = store();
        store.enqueue("fp").unwrap();
        store.claim_pending("w0").unwrap();
        store.complete("fp", "make image PROFILE=x").unwrap();

        let job = store.get_job("fp").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert_eq!(job.build_cmd.as_deref(), Some("make image PROFILE=x"));
    }

    #[test]
    fn fail_records_message() {
        let store = store();
        store.enqueue("fp").unwrap();
        store.claim_pending("w0").unwrap();
        store.fail("fp", "build: timeout").unwrap();

        let job = store.get_job("fp").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("build: timeout"));
    }

    #[test]
    fn terminal_transition_requires_building() {
        let store = store();
        store.enqueue("fp").unwrap();
        // Still pending.
        assert!(matches!(
            store.complete("fp", "cmd").unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
        store.claim_pending("w0").unwrap();
        store.fail("fp", "build: boom").unwrap();
        // Already terminal.
        assert!(matches!(
            store.fail("fp", "again").unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn failed_fingerprint_can_be_reenqueued() {
        let store = store();
        store.enqueue("fp").unwrap();
        store.claim_pending("w0").unwrap();
        store.fail("fp", "build: boom").unwrap();
        // Failure leaves no result, so a retry admission creates a new job.
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::New);
    }

    #[test]
    fn result_roundtrip_and_single_write() {
        let store = store();
        store.put_result(&result("fp")).unwrap();
        let mut altered = result("fp");
        altered.manifest = "other".into();
        store.put_result(&altered).unwrap();

        let back = store.get_result("fp").unwrap().unwrap();
        assert_eq!(back.manifest, "luci - git-24.086\n");
        assert_eq!(back.images, vec!["sysupgrade.bin"]);
        assert!(!back.cache_hit);
    }

    #[test]
    fn requeue_building_returns_job_to_pending() {
        let store = store();
        store.enqueue("fp").unwrap();
        store.claim_pending("w0").unwrap();
        store.requeue_building("fp").unwrap();

        let job = store.get_job("fp").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker.is_none());
        assert_eq!(store.queue_length().unwrap(), 1);
    }

    #[test]
    fn building_jobs_listed_for_recovery() {
        let store = store();
        store.enqueue("a").unwrap();
        store.enqueue("b").unwrap();
        store.claim_pending("w0").unwrap();
        let building = store.building_jobs().unwrap();
        assert_eq!(building.len(), 1);
        assert_eq!(building[0].fingerprint, "a");
    }

    #[test]
    fn expire_removes_result_and_history() {
        let store = store();
        store.enqueue("fp").unwrap();
        store.claim_pending("w0").unwrap();
        store.complete("fp", "cmd").unwrap();
        store.put_result(&result("fp")).unwrap();

        store.expire("fp").unwrap();
        assert!(store.get_result("fp").unwrap().is_none());
        assert!(store.get_job("fp").unwrap().is_none());
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::New);
    }

    #[test]
    fn expired_fingerprints_split_ttls() {
        let store = store();
        store.put_result(&result("built")).unwrap();
        store.enqueue("broken").unwrap();
        store.claim_pending("w0").unwrap();
        store.fail("broken", "build: boom").unwrap();

        // Nothing is expired with generous TTLs.
        let expired = store
            .expired_fingerprints(Duration::from_secs(3600), Duration::from_secs(3600))
            .unwrap();
        assert!(expired.is_empty());

        // Zero TTLs expire both.
        let expired = store
            .expired_fingerprints(Duration::ZERO, Duration::ZERO)
            .unwrap();
        assert!(expired.contains(&"built".to_string()));
        assert!(expired.contains(&"broken".to_string()));
    }

    #[test]
    fn counters_accumulate() {
        let store = store();
        store.increment_counter("cache-hits").unwrap();
        store.increment_counter("cache-hits").unwrap();
        store.increment_counter("builds-failed").unwrap();
        let counters = store.counters().unwrap();
        assert_eq!(counters["cache-hits"], 2);
        assert_eq!(counters["builds-failed"], 1);
    }

    #[test]
    fn metadata_cache_respects_expiry() {
        let store = store();
        let value = serde_json::json!({"defaults": ["base-files", "busybox"]});
        store
            .cache_put("probe:24.10.0:ath79/generic:archer", &value, Duration::from_secs(600))
            .unwrap();
        assert_eq!(
            store.cache_get("probe:24.10.0:ath79/generic:archer").unwrap(),
            Some(value.clone())
        );

        store
            .cache_put("probe:stale", &value, Duration::ZERO)
            .unwrap();
        assert_eq!(store.cache_get("probe:stale").unwrap(), None);
        assert_eq!(store.cache_get("probe:missing").unwrap(), None);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.db");
        {
            let store = JobStore::open(&path).unwrap();
            store.put_request("fp", &request("x")).unwrap();
            store.enqueue("fp").unwrap();
        }
        let store = JobStore::open(&path).unwrap();
        assert!(store.get_request("fp").unwrap().is_some());
        assert_eq!(store.queue_length().unwrap(), 1);
        assert_eq!(store.enqueue("fp").unwrap(), EnqueueOutcome::AlreadyInFlight);
    }
}
