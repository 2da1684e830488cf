// SPDX-License-Identifier: MIT OR Apache-2.0
//! The declarative build request and its validation rules.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Release versions (`24.10.0`, `23.05.0-rc2`), branch snapshots
/// (`24.10-SNAPSHOT`) and the rolling `SNAPSHOT`.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\d+(\.\d+)?(-rc\d+)?(-SNAPSHOT)?|SNAPSHOT)$").unwrap()
});

/// `target/subtarget` with exactly one slash.
static TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+/[a-zA-Z0-9_.-]+$").unwrap());

/// Conservative token for distributions, profiles, and package names.
/// Package names may carry a leading `-` to signal removal in diff mode.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?[a-zA-Z0-9_.+-]+$").unwrap());

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A request violated one of the invariants in the data model.
///
/// Each variant names the offending field so the API boundary can surface
/// a precise `400` body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A field failed its pattern check.
    #[error("invalid {field}: '{value}'")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The first-boot script exceeds the configured maximum.
    #[error("defaults script too long: {len} bytes (max {max})")]
    DefaultsTooLong {
        /// Actual script length in bytes.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// First-boot scripts are administratively disabled.
    #[error("defaults scripts are not allowed on this server")]
    DefaultsNotAllowed,

    /// The requested rootfs size exceeds the configured maximum.
    #[error("rootfs_size_mb too large: {requested} (max {max})")]
    RootfsTooLarge {
        /// Requested size in MiB.
        requested: u32,
        /// Configured cap.
        max: u32,
    },

    /// `repositories` and `repository_keys` are not paired positionally.
    #[error("repository_keys length {keys} does not match repositories length {repos}")]
    RepositoryKeyMismatch {
        /// Number of repository URLs.
        repos: usize,
        /// Number of signing keys.
        keys: usize,
    },
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Administrative caps applied during validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    /// Maximum byte length of the `defaults` first-boot script.
    pub max_defaults_length: usize,
    /// Maximum custom rootfs partition size in MiB.
    pub max_rootfs_size_mb: u32,
    /// Whether first-boot scripts are honored at all.
    pub allow_defaults: bool,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_defaults_length: 20_480,
            max_rootfs_size_mb: 1024,
            allow_defaults: true,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildRequest
// ---------------------------------------------------------------------------

/// A declarative firmware build request.
///
/// Immutable once canonicalized; identity is the fingerprint computed by
/// [`fingerprint`](crate::fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Distribution name, e.g. `openwrt`.
    #[serde(default = "default_distribution")]
    pub distribution: String,

    /// Release version (`24.10.0`) or snapshot (`SNAPSHOT`, `24.10-SNAPSHOT`).
    pub version: String,

    /// Hardware family and variant as `target/subtarget`.
    pub target: String,

    /// Device model within the target.
    pub profile: String,

    /// Requested package names. Unordered on the wire; sorted and
    /// deduplicated by canonicalization. A leading `-` marks a removal when
    /// `diff_packages` is set.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Optional version pins, package name to version string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages_versions: BTreeMap<String, String>,

    /// When true, `packages` is a delta over the device's default set rather
    /// than an absolute list.
    #[serde(default)]
    pub diff_packages: bool,

    /// When true, the build uses `packages` verbatim and skips resolution.
    /// Set by clients replaying a request returned from the prepare endpoint.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_package_resolution: bool,

    /// First-boot configuration script, run once on initial startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<String>,

    /// Custom rootfs partition size in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_size_mb: Option<u32>,

    /// Extra opkg feeds, in precedence order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,

    /// Signing keys paired positionally with `repositories`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_keys: Vec<String>,

    /// Opaque client identifier for provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    /// When the request was first seen.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_distribution() -> String {
    "openwrt".to_string()
}

impl BuildRequest {
    /// Check every pattern and cap constraint against `limits`.
    ///
    /// Field checks run in declaration order so the reported error is stable
    /// for a given request.
    pub fn validate(&self, limits: &ValidationLimits) -> Result<(), ValidationError> {
        if self.distribution.is_empty() || !TOKEN_RE.is_match(&self.distribution) {
            return Err(ValidationError::InvalidField {
                field: "distribution",
                value: self.distribution.clone(),
            });
        }
        if !VERSION_RE.is_match(&self.version) {
            return Err(ValidationError::InvalidField {
                field: "version",
                value: self.version.clone(),
            });
        }
        if !TARGET_RE.is_match(&self.target) {
            return Err(ValidationError::InvalidField {
                field: "target",
                value: self.target.clone(),
            });
        }
        if !TOKEN_RE.is_match(&self.profile) || self.profile.starts_with('-') {
            return Err(ValidationError::InvalidField {
                field: "profile",
                value: self.profile.clone(),
            });
        }
        for pkg in &self.packages {
            if !TOKEN_RE.is_match(pkg) {
                return Err(ValidationError::InvalidField {
                    field: "packages",
                    value: pkg.clone(),
                });
            }
        }
        for (name, version) in &self.packages_versions {
            if !TOKEN_RE.is_match(name) || name.starts_with('-') {
                return Err(ValidationError::InvalidField {
                    field: "packages_versions",
                    value: name.clone(),
                });
            }
            if version.is_empty() {
                return Err(ValidationError::InvalidField {
                    field: "packages_versions",
                    value: format!("{name}="),
                });
            }
        }
        if let Some(defaults) = &self.defaults
            && !defaults.trim().is_empty()
        {
            if !limits.allow_defaults {
                return Err(ValidationError::DefaultsNotAllowed);
            }
            if defaults.len() > limits.max_defaults_length {
                return Err(ValidationError::DefaultsTooLong {
                    len: defaults.len(),
                    max: limits.max_defaults_length,
                });
            }
        }
        if let Some(size) = self.rootfs_size_mb
            && size > limits.max_rootfs_size_mb
        {
            return Err(ValidationError::RootfsTooLarge {
                requested: size,
                max: limits.max_rootfs_size_mb,
            });
        }
        if self.repositories.len() != self.repository_keys.len() {
            return Err(ValidationError::RepositoryKeyMismatch {
                repos: self.repositories.len(),
                keys: self.repository_keys.len(),
            });
        }
        Ok(())
    }

    /// The `target` component before the slash.
    pub fn target_name(&self) -> &str {
        self.target.split('/').next().unwrap_or(&self.target)
    }

    /// The `subtarget` component after the slash, empty if missing.
    pub fn subtarget(&self) -> &str {
        self.target.split('/').nth(1).unwrap_or("")
    }
}
