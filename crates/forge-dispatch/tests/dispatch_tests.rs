// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker pool behavior against the mock container runtime.

use chrono::Utc;
use forge_build::{BuildSettings, Orchestrator};
use forge_container::MockRuntime;
use forge_core::{BuildRequest, JobStatus};
use forge_dispatch::{DispatchSettings, Dispatcher};
use forge_store::JobStore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn request(profile: &str) -> BuildRequest {
    BuildRequest {
        distribution: "openwrt".into(),
        version: "24.10.0".into(),
        target: "ath79/generic".into(),
        profile: profile.into(),
        packages: vec!["luci".into()],
        packages_versions: BTreeMap::new(),
        diff_packages: false,
        skip_package_resolution: false,
        defaults: None,
        rootfs_size_mb: None,
        repositories: vec![],
        repository_keys: vec![],
        client: None,
        created_at: Utc::now(),
    }
}

fn harness(dir: &Path, workers: usize) -> (Arc<JobStore>, Arc<Dispatcher>) {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        runtime,
        BuildSettings {
            registry: "ghcr.io/openwrt/imagebuilder".into(),
            store_path: dir.to_path_buf(),
            allow_defaults: false,
            job_timeout: Duration::from_secs(5),
        },
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        orchestrator,
        DispatchSettings {
            worker_concurrent: workers,
            poll_interval: Duration::from_millis(20),
            build_ttl: Duration::from_secs(3600),
            failure_ttl: Duration::from_secs(3600),
            store_path: dir.to_path_buf(),
        },
    ));
    (store, dispatcher)
}

async fn wait_for_terminal(store: &JobStore, fingerprint: &str) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = store.get_job(fingerprint).unwrap()
                && job.status.is_terminal()
            {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should reach a terminal state")
}

#[tokio::test]
async fn worker_drains_queued_job() {
    let dir = tempfile::tempdir().unwrap();
    let (store, dispatcher) = harness(dir.path(), 1);

    store.put_request("fp-one", &request("one")).unwrap();
    store.enqueue("fp-one").unwrap();

    let handle = dispatcher.spawn();
    dispatcher.notifier().notify_one();

    assert_eq!(wait_for_terminal(&store, "fp-one").await, JobStatus::Completed);
    assert!(store.get_result("fp-one").unwrap().is_some());
    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_workers_never_share_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let (store, dispatcher) = harness(dir.path(), 4);

    let fingerprints: Vec<String> = (0..12).map(|i| format!("fp-{i}")).collect();
    for fp in &fingerprints {
        store.put_request(fp, &request(fp)).unwrap();
        store.enqueue(fp).unwrap();
    }

    let handle = dispatcher.spawn();
    dispatcher.notifier().notify_one();

    for fp in &fingerprints {
        assert_eq!(wait_for_terminal(&store, fp).await, JobStatus::Completed);
        let job = store.get_job(fp).unwrap().unwrap();
        // Exactly one worker owned the job.
        assert!(job.worker.is_some());
    }
    assert_eq!(store.queue_length().unwrap(), 0);
    assert_eq!(store.counters().unwrap()["builds-completed"], 12);
    handle.shutdown().await;
}

#[tokio::test]
async fn idle_workers_pick_up_work_on_poll_tick() {
    let dir = tempfile::tempdir().unwrap();
    let (store, dispatcher) = harness(dir.path(), 1);

    let handle = dispatcher.spawn();
    // Enqueue after startup without notifying; the tick must find it.
    store.put_request("fp-late", &request("late")).unwrap();
    store.enqueue("fp-late").unwrap();

    assert_eq!(wait_for_terminal(&store, "fp-late").await, JobStatus::Completed);
    handle.shutdown().await;
}

#[tokio::test]
async fn recovery_requeues_stale_building_without_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (store, dispatcher) = harness(dir.path(), 1);

    store.put_request("fp-stale", &request("stale")).unwrap();
    store.enqueue("fp-stale").unwrap();
    store.claim_pending("dead-worker").unwrap().unwrap();

    let report = dispatcher.recover().unwrap();
    assert_eq!(report.requeued, vec!["fp-stale".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(
        store.get_job("fp-stale").unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn recovery_fails_stale_building_with_partial_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (store, dispatcher) = harness(dir.path(), 1);

    store.put_request("fp-partial", &request("partial")).unwrap();
    store.enqueue("fp-partial").unwrap();
    store.claim_pending("dead-worker").unwrap().unwrap();

    let artifact_dir = dir.path().join("fp-partial/ath79/generic");
    std::fs::create_dir_all(&artifact_dir).unwrap();
    std::fs::write(artifact_dir.join("half-written.bin"), b"x").unwrap();

    let report = dispatcher.recover().unwrap();
    assert_eq!(report.failed, vec!["fp-partial".to_string()]);
    let job = store.get_job("fp-partial").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().starts_with("build:"));
}

#[tokio::test]
async fn janitor_sweep_expires_and_removes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        runtime,
        BuildSettings {
            registry: "ghcr.io/openwrt/imagebuilder".into(),
            store_path: dir.path().to_path_buf(),
            allow_defaults: false,
            job_timeout: Duration::from_secs(5),
        },
    ));
    // Zero TTLs: everything terminal is immediately expirable.
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        orchestrator.clone(),
        DispatchSettings {
            worker_concurrent: 1,
            poll_interval: Duration::from_millis(20),
            build_ttl: Duration::ZERO,
            failure_ttl: Duration::ZERO,
            store_path: dir.path().to_path_buf(),
        },
    ));

    store.put_request("fp-old", &request("old")).unwrap();
    store.enqueue("fp-old").unwrap();
    let job = store.claim_pending("w0").unwrap().unwrap();
    orchestrator.run_job(&job).await;
    assert!(dir.path().join("fp-old").is_dir());

    let expired = dispatcher.sweep_expired_once().await.unwrap();
    assert_eq!(expired, vec!["fp-old".to_string()]);
    assert!(store.get_result("fp-old").unwrap().is_none());
    assert!(store.get_job("fp-old").unwrap().is_none());
    assert!(!dir.path().join("fp-old").exists());
}
