// SPDX-License-Identifier: MIT OR Apache-2.0
//! Container runtime capability.
//!
//! The build orchestrator drives an ephemeral ImageBuilder container through
//! the three operations of [`ContainerRuntime`]. The driver never interprets
//! ImageBuilder behavior; it reports the exit code and the captured combined
//! output stream and leaves classification to the caller. Containers are
//! always removed on exit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cli;
mod mock;

pub use cli::CliRuntime;
pub use mock::MockRuntime;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Driver failures. `run` failures describe the inability to execute a
/// container at all; a container that ran and exited non-zero is reported
/// through [`RunOutput`], not an error.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The runtime binary could not be spawned.
    #[error("failed to spawn container runtime: {0}")]
    Spawn(#[source] std::io::Error),

    /// A runtime CLI invocation failed before the workload ran.
    #[error("container runtime error: {message}")]
    Runtime {
        /// Captured runtime diagnostics.
        message: String,
    },

    /// The requested image could not be pulled.
    #[error("failed to pull image '{tag}': {message}")]
    Pull {
        /// The image tag.
        tag: String,
        /// Captured runtime diagnostics.
        message: String,
    },
}

/// A bind mount between the host and the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    /// Host path.
    pub host: PathBuf,
    /// Absolute path inside the container.
    pub container: String,
    /// True for read-only input mounts.
    pub read_only: bool,
}

impl Mount {
    /// Read-only input mount.
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// Read-write output mount.
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// One container invocation.
#[derive(Clone, Debug)]
pub struct RunSpec {
    /// Image tag to run.
    pub image: String,
    /// Command argv executed inside the container.
    pub command: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Deadline after which the container is terminated.
    pub timeout: Duration,
}

/// What happened when a container ran.
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// Process exit code; `-1` when terminated by the deadline.
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
    /// True when the deadline fired and the container was killed.
    pub timed_out: bool,
}

impl RunOutput {
    /// True for a clean zero exit within the deadline.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// The container runtime as an opaque capability.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Local cache probe for an image tag.
    async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError>;

    /// Idempotent image fetch; no-op when the tag is already present.
    async fn pull(&self, tag: &str) -> Result<(), ContainerError>;

    /// Run a command in an ephemeral container and capture its output.
    async fn run(&self, spec: RunSpec) -> Result<RunOutput, ContainerError>;
}
