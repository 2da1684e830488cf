// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and env overrides for imageforge.
//!
//! [`ForgeConfig`] carries every recognized runtime setting with defaults
//! suitable for a development machine. Settings load from an optional TOML
//! file with `FORGE_*` environment variables applied on top.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The per-job timeout is unusually large.
    LargeJobTimeout {
        /// Configured timeout in seconds.
        secs: u64,
    },
    /// First-boot scripts are enabled; injected content reaches builds.
    DefaultsEnabled,
    /// Failure TTL exceeds the success TTL, which keeps failures cached
    /// longer than results.
    FailureTtlExceedsBuildTtl,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeJobTimeout { secs } => {
                write!(f, "job_timeout_seconds is large ({secs}s)")
            }
            ConfigWarning::DefaultsEnabled => {
                write!(f, "allow_defaults is on; first-boot scripts will be injected")
            }
            ConfigWarning::FailureTtlExceedsBuildTtl => {
                write!(f, "failure_ttl_seconds exceeds build_ttl_seconds")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime settings for the imageforge daemon.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// Bind host for the HTTP API.
    pub server_host: String,
    /// Bind port for the HTTP API.
    pub server_port: u16,
    /// Root directory for per-fingerprint artifact directories.
    pub store_path: PathBuf,
    /// Path to the state database, relative paths under `store_path`.
    pub database_path: PathBuf,
    /// Container runtime endpoint, e.g. `unix:///var/run/docker.sock`.
    pub container_socket_path: Option<String>,
    /// Registry prefix for ImageBuilder tags.
    pub imagebuilder_registry: String,
    /// Admission cap on the PENDING backlog.
    pub max_pending_jobs: usize,
    /// Per-build deadline in seconds.
    pub job_timeout_seconds: u64,
    /// TTL for successful results.
    pub build_ttl_seconds: u64,
    /// TTL for failed outcomes.
    pub failure_ttl_seconds: u64,
    /// Whether first-boot scripts are honored.
    pub allow_defaults: bool,
    /// Number of concurrent build workers.
    pub worker_concurrent: usize,
    /// Dispatcher tick in seconds.
    pub worker_poll_seconds: u64,
    /// Maximum byte length of a first-boot script.
    pub max_defaults_length: usize,
    /// Maximum custom rootfs size in MiB.
    pub max_custom_rootfs_size_mb: u32,
    /// Log level override (`error`..`trace`).
    pub log_level: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            server_port: 8084,
            store_path: PathBuf::from("store"),
            database_path: PathBuf::from("forge.db"),
            container_socket_path: None,
            imagebuilder_registry: "ghcr.io/openwrt/imagebuilder".into(),
            max_pending_jobs: 200,
            job_timeout_seconds: 600,
            build_ttl_seconds: 86_400,
            failure_ttl_seconds: 3_600,
            allow_defaults: false,
            worker_concurrent: 2,
            worker_poll_seconds: 5,
            max_defaults_length: 20_480,
            max_custom_rootfs_size_mb: 1024,
            log_level: Some("info".into()),
        }
    }
}

impl ForgeConfig {
    /// Per-build deadline as a [`Duration`].
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    /// Dispatcher tick as a [`Duration`].
    pub fn worker_poll(&self) -> Duration {
        Duration::from_secs(self.worker_poll_seconds)
    }

    /// Success-result TTL as a [`Duration`].
    pub fn build_ttl(&self) -> Duration {
        Duration::from_secs(self.build_ttl_seconds)
    }

    /// Failure TTL as a [`Duration`].
    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_seconds)
    }

    /// Absolute database path (relative paths land under `store_path`).
    pub fn database_file(&self) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            self.store_path.join(&self.database_path)
        }
    }
}

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// One day; anything beyond this in `job_timeout_seconds` is a hard error.
const MAX_JOB_TIMEOUT_SECS: u64 = 86_400;

/// Builds beyond an hour are legal but suspicious.
const LARGE_JOB_TIMEOUT_SECS: u64 = 3_600;

/// Load a [`ForgeConfig`] from an optional TOML file path.
///
/// With `None`, defaults are used. `FORGE_*` environment overrides are
/// applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ForgeConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ForgeConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`ForgeConfig`].
pub fn parse_toml(content: &str) -> Result<ForgeConfig, ConfigError> {
    toml::from_str::<ForgeConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `FORGE_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut ForgeConfig) {
    if let Ok(val) = std::env::var("FORGE_SERVER_HOST") {
        config.server_host = val;
    }
    if let Ok(val) = std::env::var("FORGE_SERVER_PORT")
        && let Ok(port) = val.parse()
    {
        config.server_port = port;
    }
    if let Ok(val) = std::env::var("FORGE_STORE_PATH") {
        config.store_path = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("FORGE_CONTAINER_SOCKET_PATH") {
        config.container_socket_path = Some(val);
    }
    if let Ok(val) = std::env::var("FORGE_IMAGEBUILDER_REGISTRY") {
        config.imagebuilder_registry = val;
    }
    if let Ok(val) = std::env::var("FORGE_WORKER_CONCURRENT")
        && let Ok(n) = val.parse()
    {
        config.worker_concurrent = n;
    }
    if let Ok(val) = std::env::var("FORGE_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}

/// Validate a parsed configuration, returning advisory warnings.
pub fn validate_config(config: &ForgeConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }
    if config.server_host.trim().is_empty() {
        errors.push("server_host must not be empty".into());
    }
    if config.imagebuilder_registry.trim().is_empty() {
        errors.push("imagebuilder_registry must not be empty".into());
    }
    if config.max_pending_jobs == 0 {
        errors.push("max_pending_jobs must be at least 1".into());
    }
    if config.worker_concurrent == 0 {
        errors.push("worker_concurrent must be at least 1".into());
    }
    if config.worker_poll_seconds == 0 {
        errors.push("worker_poll_seconds must be at least 1".into());
    }
    match config.job_timeout_seconds {
        0 => errors.push("job_timeout_seconds must be at least 1".into()),
        t if t > MAX_JOB_TIMEOUT_SECS => errors.push(format!(
            "job_timeout_seconds {t} out of range (1..{MAX_JOB_TIMEOUT_SECS})"
        )),
        t if t > LARGE_JOB_TIMEOUT_SECS => {
            warnings.push(ConfigWarning::LargeJobTimeout { secs: t });
        }
        _ => {}
    }
    if config.max_defaults_length == 0 {
        errors.push("max_defaults_length must be at least 1".into());
    }

    if config.allow_defaults {
        warnings.push(ConfigWarning::DefaultsEnabled);
    }
    if config.failure_ttl_seconds > config.build_ttl_seconds {
        warnings.push(ConfigWarning::FailureTtlExceedsBuildTtl);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}
