// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-job build pipeline.
//!
//! For each claimed job the orchestrator pulls the right ImageBuilder image,
//! probes its default package set, resolves the final package list, runs the
//! image build with the per-fingerprint artifact directory mounted, captures
//! the manifest, discovers artifacts, and publishes a [`BuildResult`]. Every
//! failure is classified into a phase so clients see `<phase>: <reason>`.
//!
//! The orchestrator writes only inside `store/<fingerprint>/` and updates the
//! statistics counters exactly once per terminal transition.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod artifacts;
mod probe;

pub use artifacts::discover_artifacts;
pub use probe::{image_tag, parse_default_packages};

use chrono::Utc;
use forge_container::{ContainerError, ContainerRuntime, Mount, RunOutput, RunSpec};
use forge_core::{BuildJob, BuildRequest, BuildResult};
use forge_store::JobStore;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Pipeline phase a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Fetching the ImageBuilder image.
    Pull,
    /// Probing default packages via `make info`.
    InfoProbe,
    /// Package resolution.
    Resolve,
    /// The `make image` run.
    Build,
    /// The `make manifest` run.
    Manifest,
    /// Artifact discovery.
    Discover,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pull => "pull",
            Self::InfoProbe => "info-probe",
            Self::Resolve => "resolve",
            Self::Build => "build",
            Self::Manifest => "manifest",
            Self::Discover => "discover",
        })
    }
}

/// A failed build, classified for the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The pipeline failed in a known phase.
    #[error("{phase}: {message}")]
    Phase {
        /// Which phase failed.
        phase: Phase,
        /// Short reason.
        message: String,
    },

    /// A store inconsistency or other broken invariant.
    #[error("internal: {0}")]
    Internal(String),
}

impl BuildError {
    fn phase(phase: Phase, message: impl Into<String>) -> Self {
        Self::Phase {
            phase,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// How long memoized default-package probes stay fresh.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

/// Orchestrator knobs, extracted from the daemon configuration.
#[derive(Clone, Debug)]
pub struct BuildSettings {
    /// Registry prefix for ImageBuilder tags.
    pub registry: String,
    /// Root of the per-fingerprint artifact directories.
    pub store_path: PathBuf,
    /// Whether first-boot scripts are injected into builds.
    pub allow_defaults: bool,
    /// Per-container-run deadline.
    pub job_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one build job from claim to terminal state.
pub struct Orchestrator {
    store: Arc<JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: BuildSettings,
}

impl Orchestrator {
    /// Compose the orchestrator from its collaborators.
    pub fn new(
        store: Arc<JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            settings,
        }
    }

    /// The artifact directory for a fingerprint.
    pub fn artifact_dir(&self, fingerprint: &str) -> PathBuf {
        self.settings.store_path.join(fingerprint)
    }

    /// Run a claimed job to its terminal state.
    ///
    /// All terminal job transitions, the result write, and the statistics
    /// counters happen here; the dispatcher only supplies the claimed job.
    pub async fn run_job(&self, job: &BuildJob) {
        let fingerprint = &job.fingerprint;
        let started = Instant::now();

        match self.execute(fingerprint).await {
            Ok((mut result, build_cmd)) => {
                result.duration_seconds = started.elapsed().as_secs() as i64;
                if let Err(err) = self.store.put_result(&result) {
                    error!(fingerprint = %fingerprint, error = %err, "failed to persist result");
                }
                match self.store.complete(fingerprint, &build_cmd) {
                    Ok(()) => {
                        let _ = self.store.increment_counter("builds-completed");
                        info!(
                            fingerprint = %fingerprint,
                            images = result.images.len(),
                            seconds = result.duration_seconds,
                            "build completed"
                        );
                    }
                    Err(err) => {
                        error!(fingerprint = %fingerprint, error = %err, "completion transition failed");
                    }
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(fingerprint = %fingerprint, error = %message, "build failed");
                if let Err(store_err) = self.store.fail(fingerprint, &message) {
                    error!(fingerprint = %fingerprint, error = %store_err, "failure transition failed");
                }
                let _ = self.store.increment_counter("builds-failed");
            }
        }
    }

    /// The pipeline proper: returns the result and the recorded command line.
    async fn execute(&self, fingerprint: &str) -> Result<(BuildResult, String), BuildError> {
        let req = self
            .store
            .get_request(fingerprint)
            .map_err(|e| BuildError::Internal(e.to_string()))?
            .ok_or_else(|| BuildError::Internal(format!("no request for {fingerprint}")))?;

        // 1-2. Address the ImageBuilder and make sure it is local.
        let tag = image_tag(
            &self.settings.registry,
            &req.version,
            req.target_name(),
            req.subtarget(),
        );
        self.ensure_image(&tag).await?;

        // 3. Probe default packages (memoized per version/target/profile).
        let defaults = self.probe_default_packages(&tag, &req).await?;

        // 4. Resolve the final package list.
        let packages = if req.skip_package_resolution {
            req.packages.clone()
        } else {
            forge_resolver::resolve(&req, &defaults)
                .map_err(|e| BuildError::phase(Phase::Resolve, e.to_string()))?
                .packages
        };

        // 5. Prepare the artifact directory and the optional first-boot script.
        let artifact_dir = self.artifact_dir(fingerprint);
        tokio::fs::create_dir_all(&artifact_dir)
            .await
            .map_err(|e| BuildError::Internal(format!("create {}: {e}", artifact_dir.display())))?;

        let mut mounts = vec![Mount::read_write(&artifact_dir, "/builder/bin")];
        if let Some(defaults_script) = req.defaults.as_deref()
            && self.settings.allow_defaults
        {
            let files_dir = artifact_dir.join("files");
            write_defaults_script(&files_dir, defaults_script).await?;
            mounts.push(Mount::read_only(&files_dir, "/builder/files"));
        }

        // 6. Build.
        let mut command = vec![
            "make".to_string(),
            "image".to_string(),
            format!("PROFILE={}", req.profile),
            format!("PACKAGES={}", packages.join(" ")),
        ];
        if let Some(size) = req.rootfs_size_mb {
            command.push(format!("ROOTFS_PARTSIZE={size}"));
        }
        let build_cmd = display_command(&command);

        let out = self
            .run_with_retry(Phase::Build, &tag, command, mounts)
            .await?;
        if out.timed_out {
            return Err(BuildError::phase(Phase::Build, "timeout"));
        }
        if out.exit_code != 0 {
            return Err(BuildError::phase(
                Phase::Build,
                format!("exit code {}: {}", out.exit_code, last_line(&out.output)),
            ));
        }

        // 7. Manifest.
        let manifest_cmd = vec![
            "make".to_string(),
            "manifest".to_string(),
            format!("PROFILE={}", req.profile),
        ];
        let out = self
            .run_with_retry(Phase::Manifest, &tag, manifest_cmd, vec![])
            .await?;
        if out.timed_out || out.exit_code != 0 {
            return Err(BuildError::phase(
                Phase::Manifest,
                format!("exit code {}", out.exit_code),
            ));
        }
        let manifest = out.output;
        if manifest.trim().is_empty() {
            return Err(BuildError::phase(Phase::Manifest, "empty manifest"));
        }

        // 8. Discover artifacts.
        let images = discover_artifacts(&artifact_dir);
        if images.is_empty() {
            return Err(BuildError::phase(Phase::Discover, "no artifacts produced"));
        }

        // 9. The caller persists; duration is stamped there.
        let result = BuildResult {
            fingerprint: fingerprint.to_string(),
            images,
            manifest,
            built_at: Utc::now(),
            duration_seconds: 0,
            cache_hit: false,
        };
        Ok((result, build_cmd))
    }

    /// Make sure the image is present locally, retrying the pull once on a
    /// transient failure.
    async fn ensure_image(&self, tag: &str) -> Result<(), BuildError> {
        let present = self
            .runtime
            .image_exists(tag)
            .await
            .map_err(|e| BuildError::phase(Phase::Pull, e.to_string()))?;
        if present {
            return Ok(());
        }
        if let Err(first) = self.runtime.pull(tag).await {
            warn!(tag = %tag, error = %first, "pull failed, retrying once");
            self.runtime
                .pull(tag)
                .await
                .map_err(|e| BuildError::phase(Phase::Pull, e.to_string()))?;
        }
        Ok(())
    }

    /// Probe the default package set, memoized in the metadata cache per
    /// (version, target, profile). The cache is advisory: read and write
    /// failures degrade to a fresh probe.
    async fn probe_default_packages(
        &self,
        tag: &str,
        req: &BuildRequest,
    ) -> Result<BTreeSet<String>, BuildError> {
        let cache_key = format!("probe:{}:{}:{}", req.version, req.target, req.profile);
        match self.store.cache_get(&cache_key) {
            Ok(Some(value)) => {
                if let Ok(packages) = serde_json::from_value::<Vec<String>>(value) {
                    return Ok(packages.into_iter().collect());
                }
            }
            Ok(None) => {}
            Err(err) => warn!(key = %cache_key, error = %err, "probe cache read failed"),
        }

        let command = vec!["make".to_string(), "info".to_string()];
        let out = self
            .run_with_retry(Phase::InfoProbe, tag, command, vec![])
            .await?;
        if out.timed_out || out.exit_code != 0 {
            return Err(BuildError::phase(
                Phase::InfoProbe,
                format!("exit code {}", out.exit_code),
            ));
        }
        let defaults = parse_default_packages(&out.output);

        let cached: Vec<&String> = defaults.iter().collect();
        if let Err(err) = self.store.cache_put(
            &cache_key,
            &serde_json::json!(cached),
            PROBE_CACHE_TTL,
        ) {
            warn!(key = %cache_key, error = %err, "probe cache write failed");
        }
        Ok(defaults)
    }

    /// Run one container invocation, retrying once when the runtime itself
    /// fails (socket unavailable, spawn error). A container that ran and
    /// exited non-zero is returned, not retried.
    async fn run_with_retry(
        &self,
        phase: Phase,
        tag: &str,
        command: Vec<String>,
        mounts: Vec<Mount>,
    ) -> Result<RunOutput, BuildError> {
        let spec = RunSpec {
            image: tag.to_string(),
            command,
            env: vec![],
            mounts,
            workdir: Some("/builder".into()),
            timeout: self.settings.job_timeout,
        };
        match self.runtime.run(spec.clone()).await {
            Ok(out) => Ok(out),
            Err(first) => {
                warn!(phase = %phase, error = %first, "container run failed, retrying once");
                self.runtime
                    .run(spec)
                    .await
                    .map_err(|e: ContainerError| BuildError::phase(phase, e.to_string()))
            }
        }
    }
}

/// Write the first-boot script at `files/etc/uci-defaults/99-custom`,
/// mode 0755.
async fn write_defaults_script(files_dir: &std::path::Path, body: &str) -> Result<(), BuildError> {
    let script_dir = files_dir.join("etc/uci-defaults");
    tokio::fs::create_dir_all(&script_dir)
        .await
        .map_err(|e| BuildError::Internal(format!("create {}: {e}", script_dir.display())))?;
    let script = script_dir.join("99-custom");
    tokio::fs::write(&script, body)
        .await
        .map_err(|e| BuildError::Internal(format!("write {}: {e}", script.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| BuildError::Internal(format!("chmod {}: {e}", script.display())))?;
    }
    Ok(())
}

/// Human-readable command line for the job record.
fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.contains(' ') {
                match arg.split_once('=') {
                    Some((key, value)) => format!("{key}=\"{value}\""),
                    None => format!("\"{arg}\""),
                }
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last non-empty output line, for compact failure messages.
fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_match_error_contract() {
        let names: Vec<String> = [
            Phase::Pull,
            Phase::InfoProbe,
            Phase::Resolve,
            Phase::Build,
            Phase::Manifest,
            Phase::Discover,
        ]
        .iter()
        .map(|p| p.to_string())
        .collect();
        assert_eq!(
            names,
            vec!["pull", "info-probe", "resolve", "build", "manifest", "discover"]
        );
    }

    #[test]
    fn build_error_renders_phase_prefix() {
        let err = BuildError::phase(Phase::Build, "timeout");
        assert_eq!(err.to_string(), "build: timeout");
        let err = BuildError::Internal("store gone".into());
        assert_eq!(err.to_string(), "internal: store gone");
    }

    #[test]
    fn display_command_quotes_values_with_spaces() {
        let argv = vec![
            "make".to_string(),
            "image".to_string(),
            "PROFILE=x".to_string(),
            "PACKAGES=luci vim".to_string(),
        ];
        assert_eq!(
            display_command(&argv),
            "make image PROFILE=x PACKAGES=\"luci vim\""
        );
    }

    #[test]
    fn last_line_skips_trailing_blanks() {
        assert_eq!(last_line("a\nb\n\n"), "b");
        assert_eq!(last_line(""), "no output");
    }
}
