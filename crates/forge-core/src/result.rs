// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cached build results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Descriptor of a finished, published build.
///
/// Written exactly once per fingerprint by the orchestrator and immutable
/// thereafter; expiry deletes the whole record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// Fingerprint of the request that produced this result.
    pub fingerprint: String,
    /// Artifact filenames relative to the per-fingerprint blob directory.
    pub images: Vec<String>,
    /// ImageBuilder manifest: installed package name/version pairs.
    pub manifest: String,
    /// When the build finished.
    pub built_at: DateTime<Utc>,
    /// Wall-clock build duration in seconds.
    pub duration_seconds: i64,
    /// Always false at write time; the read path flips it to signal
    /// deduplication to the caller.
    pub cache_hit: bool,
}

impl BuildResult {
    /// Copy of `self` with the cache-hit flag raised, for read-path replies.
    pub fn as_cache_hit(&self) -> Self {
        Self {
            cache_hit: true,
            ..self.clone()
        }
    }
}
