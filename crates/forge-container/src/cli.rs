// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI-backed container driver.
//!
//! Drives a `docker`-compatible binary (docker or podman). Workloads run with
//! `--rm` so no persistent containers are kept; the per-invocation deadline is
//! enforced on the host side and the child is killed when it fires.

use crate::{ContainerError, ContainerRuntime, RunOutput, RunSpec};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Container driver shelling out to a docker-compatible CLI.
#[derive(Clone, Debug)]
pub struct CliRuntime {
    binary: PathBuf,
    socket: Option<String>,
}

impl CliRuntime {
    /// Use the given runtime binary (`docker`, `podman`, or a full path).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            socket: None,
        }
    }

    /// Point the CLI at a non-default runtime socket (`DOCKER_HOST`).
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    /// Locate `docker` or `podman` on `PATH`.
    pub fn from_path() -> Option<Self> {
        for name in ["docker", "podman"] {
            if let Some(path) = which(name) {
                return Some(Self::new(path));
            }
        }
        None
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(socket) = &self.socket {
            cmd.env("DOCKER_HOST", socket);
        }
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<(i32, String), ContainerError> {
        debug!(binary = %self.binary.display(), ?args, "container cli");
        let out = self
            .command(args)
            .output()
            .await
            .map_err(ContainerError::Spawn)?;
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok((out.status.code().unwrap_or(-1), combined))
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError> {
        let (code, _) = self.output(&["image", "inspect", tag]).await?;
        Ok(code == 0)
    }

    async fn pull(&self, tag: &str) -> Result<(), ContainerError> {
        if self.image_exists(tag).await? {
            return Ok(());
        }
        let (code, output) = self.output(&["pull", tag]).await?;
        if code != 0 {
            return Err(ContainerError::Pull {
                tag: tag.to_string(),
                message: tail(&output, 512),
            });
        }
        Ok(())
    }

    async fn run(&self, spec: RunSpec) -> Result<RunOutput, ContainerError> {
        let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
        for mount in &spec.mounts {
            let mode = if mount.read_only { ":ro" } else { "" };
            args.push("-v".into());
            args.push(format!(
                "{}:{}{mode}",
                mount.host.display(),
                mount.container
            ));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut cmd = self.command(&arg_refs);
        // Killing the CLI process tears down the container because of --rm.
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(ContainerError::Spawn)?;
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                Ok(RunOutput {
                    exit_code: out.status.code().unwrap_or(-1),
                    output: combined,
                    timed_out: false,
                })
            }
            Ok(Err(err)) => Err(ContainerError::Runtime {
                message: err.to_string(),
            }),
            Err(_) => {
                warn!(image = %spec.image, timeout = ?spec.timeout, "container run hit deadline");
                Ok(RunOutput {
                    exit_code: -1,
                    output: String::new(),
                    timed_out: true,
                })
            }
        }
    }
}

fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for p in std::env::split_paths(&path) {
        let candidate = p.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim_end().to_string()
    } else {
        let start = s.len() - max;
        // Avoid slicing mid-codepoint.
        let start = (start..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(start);
        format!("...{}", s[start..].trim_end())
    }
}
