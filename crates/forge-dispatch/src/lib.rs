// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker pool and queue dispatch.
//!
//! N worker fibers repeatedly claim the oldest PENDING job and hand it to the
//! build orchestrator. Workers wake on an explicit notification (signalled at
//! admission) or on the poll tick, whichever comes first; admission never
//! blocks a worker and workers never block admission.
//!
//! The dispatcher also owns the startup recovery sweep for stale BUILDING
//! jobs and the TTL janitor that expires old results and artifact trees.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use forge_build::{Orchestrator, discover_artifacts};
use forge_store::{JobStore, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the TTL janitor sweeps.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Dispatcher knobs, extracted from the daemon configuration.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Number of concurrent build workers.
    pub worker_concurrent: usize,
    /// Tick interval for idle workers.
    pub poll_interval: Duration,
    /// TTL for successful results.
    pub build_ttl: Duration,
    /// TTL for failed outcomes.
    pub failure_ttl: Duration,
    /// Root of the per-fingerprint artifact directories.
    pub store_path: PathBuf,
}

/// What the startup recovery sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale BUILDING jobs returned to PENDING (artifact dir was empty).
    pub requeued: Vec<String>,
    /// Stale BUILDING jobs failed (partial artifact tree present).
    pub failed: Vec<String>,
}

/// Coordinates workers, recovery, and expiry around the job store.
///
/// Cheap to clone; every clone shares the same store, orchestrator, and
/// wakeup handle.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<JobStore>,
    orchestrator: Arc<Orchestrator>,
    settings: DispatchSettings,
    notify: Arc<Notify>,
}

impl Dispatcher {
    /// Compose the dispatcher from its collaborators.
    pub fn new(
        store: Arc<JobStore>,
        orchestrator: Arc<Orchestrator>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            settings,
            notify: Arc::new(Notify::new()),
        }
    }

    /// The admission-side wakeup handle; `notify_one` after each enqueue.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Sweep stale BUILDING jobs left behind by a previous process.
    ///
    /// Builds run in ephemeral containers, so a crash leaves at most the
    /// BUILDING marker: jobs with an empty artifact directory are requeued,
    /// jobs with a partial artifact tree are failed.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for job in self.store.building_jobs()? {
            let dir = self.settings.store_path.join(&job.fingerprint);
            let partial = dir.is_dir() && !discover_artifacts(&dir).is_empty();
            if partial {
                self.store
                    .fail(&job.fingerprint, "build: interrupted, partial artifacts present")?;
                report.failed.push(job.fingerprint);
            } else {
                self.store.requeue_building(&job.fingerprint)?;
                report.requeued.push(job.fingerprint);
            }
        }
        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "recovered stale building jobs"
            );
        }
        Ok(report)
    }

    /// One janitor pass: expire results and failures past their TTL and
    /// remove their artifact directories.
    pub async fn sweep_expired_once(&self) -> Result<Vec<String>, StoreError> {
        let expired = self
            .store
            .expired_fingerprints(self.settings.build_ttl, self.settings.failure_ttl)?;
        for fingerprint in &expired {
            self.store.expire(fingerprint)?;
            let dir = self.settings.store_path.join(fingerprint);
            if dir.is_dir() {
                if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(fingerprint = %fingerprint, error = %err, "failed to remove artifact dir");
                }
            }
            info!(fingerprint = %fingerprint, "expired cached outcome");
        }
        Ok(expired)
    }

    /// Spawn the worker fibers and the janitor. The returned handle stops
    /// them; in-flight jobs are left BUILDING for the next recovery sweep.
    pub fn spawn(&self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.settings.worker_concurrent + 1);

        for index in 0..self.settings.worker_concurrent {
            let dispatcher = self.clone();
            let shutdown = shutdown_rx.clone();
            let worker_id = format!("worker-{index}-{}", short_id());
            tasks.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, shutdown).await;
            }));
        }

        let dispatcher = self.clone();
        let mut shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                        if let Err(err) = dispatcher.sweep_expired_once().await {
                            error!(error = %err, "janitor sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        DispatcherHandle { shutdown_tx, tasks }
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.claim_pending(&worker_id) {
                Ok(Some(job)) => {
                    debug!(worker = %worker_id, fingerprint = %job.fingerprint, "claimed job");
                    tokio::select! {
                        _ = self.orchestrator.run_job(&job) => {}
                        _ = shutdown.changed() => {
                            // The job stays BUILDING; the next startup's
                            // recovery sweep reclaims it.
                            warn!(
                                worker = %worker_id,
                                fingerprint = %job.fingerprint,
                                "shutdown during build"
                            );
                            break;
                        }
                    }
                    // Look for more work immediately; the queue may be deep.
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(worker = %worker_id, error = %err, "claim failed");
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(worker = %worker_id, "worker stopped");
    }
}

/// Running worker pool; dropping it without [`shutdown`](Self::shutdown)
/// aborts nothing (tasks keep running on the runtime).
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal all workers and the janitor to stop, then wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
