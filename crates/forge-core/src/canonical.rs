// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonicalization and content addressing.
//!
//! Two semantically equivalent requests must produce the same fingerprint.
//! The rendering below is append-only: optional fields contribute bytes only
//! when present, so a minimal request keeps a stable fingerprint as the data
//! model grows.

use crate::request::{BuildRequest, ValidationError, ValidationLimits};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Normalize a request in place and verify its invariants.
///
/// Rules, in order: validate patterns and caps, sort and deduplicate
/// `packages`, trim trailing whitespace from `defaults` (leading whitespace
/// and interior content are user script text and left alone). Repository
/// order is preserved because feed precedence is semantically meaningful.
pub fn canonicalize(
    mut req: BuildRequest,
    limits: &ValidationLimits,
) -> Result<BuildRequest, ValidationError> {
    req.validate(limits)?;

    req.packages.sort_unstable();
    req.packages.dedup();

    if let Some(defaults) = req.defaults.take() {
        let trimmed = defaults.trim_end();
        if trimmed.is_empty() {
            req.defaults = None;
        } else {
            req.defaults = Some(trimmed.to_string());
        }
    }

    Ok(req)
}

/// Hex-encoded SHA-256 fingerprint of a canonicalized request.
///
/// Field rendering is `:`-separated in a fixed order; pins, repositories and
/// the defaults script append only when present. Callers must pass a request
/// that already went through [`canonicalize`]; the function re-sorts nothing.
pub fn fingerprint(req: &BuildRequest) -> String {
    let mut rendering = String::new();
    rendering.push_str(&req.distribution);
    rendering.push(':');
    rendering.push_str(&req.version);
    rendering.push(':');
    rendering.push_str(&req.target);
    rendering.push(':');
    rendering.push_str(&req.profile);
    rendering.push(':');
    rendering.push_str(&req.packages.join(","));
    rendering.push(':');
    rendering.push_str(if req.diff_packages { "true" } else { "false" });
    rendering.push(':');
    let _ = write!(rendering, "{}", req.rootfs_size_mb.unwrap_or(0));

    for (name, version) in &req.packages_versions {
        let _ = write!(rendering, ":{name}={version}");
    }
    for url in &req.repositories {
        let _ = write!(rendering, ":{url}");
    }
    if let Some(defaults) = &req.defaults
        && !defaults.is_empty()
    {
        let _ = write!(rendering, ":{defaults}");
    }

    let digest = Sha256::digest(rendering.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
