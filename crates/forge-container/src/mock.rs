// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scriptable in-process runtime for tests.

use crate::{ContainerError, ContainerRuntime, RunOutput, RunSpec};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// A fake [`ContainerRuntime`] that replays configured outputs instead of
/// shelling out.
///
/// `make info` replies with a `Default Packages:` line, `make image` writes
/// the configured artifact files into the read-write mount, and
/// `make manifest` replies with the configured manifest text. Behavior knobs
/// cover the failure modes the orchestrator must classify.
pub struct MockRuntime {
    default_packages: String,
    manifest: String,
    artifacts: Vec<String>,
    build_delay: Duration,
    build_exit_code: i32,
    fail_pull: bool,
    pulled: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            default_packages: "base-files busybox dropbear mtd uci opkg netifd".into(),
            manifest: "base-files - 1565\nluci - git-24.086.45142\n".into(),
            artifacts: vec![
                "ath79/generic/openwrt-24.10.0-ath79-generic-tplink_archer-c7-v5-squashfs-sysupgrade.bin".into(),
            ],
            build_delay: Duration::ZERO,
            build_exit_code: 0,
            fail_pull: false,
            pulled: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockRuntime {
    /// A runtime that happily builds the default artifact set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `Default Packages:` probe line content.
    pub fn with_default_packages(mut self, packages: &str) -> Self {
        self.default_packages = packages.to_string();
        self
    }

    /// Override the manifest text.
    pub fn with_manifest(mut self, manifest: &str) -> Self {
        self.manifest = manifest.to_string();
        self
    }

    /// Override the artifact files written on `make image` (paths relative
    /// to the read-write mount).
    pub fn with_artifacts(mut self, artifacts: &[&str]) -> Self {
        self.artifacts = artifacts.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Make `make image` take this long (for deadline tests).
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Make `make image` exit with this code.
    pub fn with_build_exit_code(mut self, code: i32) -> Self {
        self.build_exit_code = code;
        self
    }

    /// Make every `pull` fail.
    pub fn with_failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    /// Every command line the runtime has executed, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, spec: &RunSpec) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.command.join(" "));
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError> {
        Ok(self
            .pulled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tag))
    }

    async fn pull(&self, tag: &str) -> Result<(), ContainerError> {
        if self.fail_pull {
            return Err(ContainerError::Pull {
                tag: tag.to_string(),
                message: "manifest unknown".into(),
            });
        }
        self.pulled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string());
        Ok(())
    }

    async fn run(&self, spec: RunSpec) -> Result<RunOutput, ContainerError> {
        self.record(&spec);
        let line = spec.command.join(" ");

        if line.contains("info") {
            return Ok(RunOutput {
                exit_code: 0,
                output: format!(
                    "Current Target: \"test\"\nDefault Packages: {}\nExtra packages: none\n",
                    self.default_packages
                ),
                timed_out: false,
            });
        }

        if line.contains("manifest") {
            return Ok(RunOutput {
                exit_code: 0,
                output: self.manifest.clone(),
                timed_out: false,
            });
        }

        if line.contains("image") {
            if self.build_delay >= spec.timeout && spec.timeout > Duration::ZERO {
                tokio::time::sleep(spec.timeout).await;
                return Ok(RunOutput {
                    exit_code: -1,
                    output: String::new(),
                    timed_out: true,
                });
            }
            tokio::time::sleep(self.build_delay).await;

            if self.build_exit_code != 0 {
                return Ok(RunOutput {
                    exit_code: self.build_exit_code,
                    output: "make: *** [Makefile:image] Error 1\n".into(),
                    timed_out: false,
                });
            }

            // Write artifacts into the read-write mount, like the real
            // ImageBuilder populating /builder/bin.
            if let Some(rw) = spec.mounts.iter().find(|m| !m.read_only) {
                for artifact in &self.artifacts {
                    let path = rw.host.join(artifact);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(ContainerError::Spawn)?;
                    }
                    std::fs::write(&path, b"firmware").map_err(ContainerError::Spawn)?;
                }
            }
            return Ok(RunOutput {
                exit_code: 0,
                output: "Building images...\n".into(),
                timed_out: false,
            });
        }

        Ok(RunOutput {
            exit_code: 0,
            output: String::new(),
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mount;

    fn spec(command: &[&str], mounts: Vec<Mount>) -> RunSpec {
        RunSpec {
            image: "registry:24.10.0-ath79-generic".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            mounts,
            workdir: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn info_reports_default_packages() {
        let runtime = MockRuntime::new().with_default_packages("base-files busybox");
        let out = runtime.run(spec(&["make", "info"], vec![])).await.unwrap();
        assert!(out.success());
        assert!(out.output.contains("Default Packages: base-files busybox"));
    }

    #[tokio::test]
    async fn image_writes_artifacts_into_rw_mount() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new().with_artifacts(&["ath79/generic/fw-sysupgrade.bin"]);
        let mounts = vec![Mount::read_write(dir.path(), "/builder/bin")];
        let out = runtime
            .run(spec(&["make", "image", "PROFILE=x"], mounts))
            .await
            .unwrap();
        assert!(out.success());
        assert!(dir.path().join("ath79/generic/fw-sysupgrade.bin").is_file());
    }

    #[tokio::test]
    async fn pull_is_remembered_by_image_exists() {
        let runtime = MockRuntime::new();
        assert!(!runtime.image_exists("tag").await.unwrap());
        runtime.pull("tag").await.unwrap();
        assert!(runtime.image_exists("tag").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_build_times_out() {
        let runtime = MockRuntime::new().with_build_delay(Duration::from_secs(60));
        let mut s = spec(&["make", "image"], vec![]);
        s.timeout = Duration::from_secs(1);
        let out = runtime.run(s).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
