// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire envelopes for the build API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use forge_core::{BuildJob, BuildRequest, BuildResult, JobStatus};
use forge_resolver::PackageChange;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// API failure carrying the HTTP status and a single `{error}` body.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to respond with.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error response.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 400 — canonicalization or validation failure.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 404 — unknown fingerprint.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 429 — admission refused, queue full.
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    /// 500 — store inconsistency or other internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Build status envelope
// ---------------------------------------------------------------------------

/// Envelope returned by the submit and status endpoints.
///
/// Optional fields appear only when meaningful for the reported status, so a
/// pending reply stays minimal while a completed one carries the artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    /// Fingerprint of the canonical request.
    pub request_hash: String,
    /// Lifecycle state being reported.
    pub status: JobStatus,
    /// Artifact paths relative to the fingerprint blob directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// ImageBuilder manifest text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    /// Build duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_duration: Option<i64>,
    /// True when the reply was served from the result cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    /// 1-based position among pending jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    /// When a worker claimed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Phase-tagged failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BuildStatusResponse {
    /// Terminal success envelope from a cached result.
    pub fn completed(result: &BuildResult) -> Self {
        Self {
            request_hash: result.fingerprint.clone(),
            status: JobStatus::Completed,
            images: Some(result.images.clone()),
            manifest: Some(result.manifest.clone()),
            build_duration: Some(result.duration_seconds),
            cache_hit: Some(result.cache_hit),
            queue_position: None,
            started_at: None,
            error_message: None,
        }
    }

    /// In-flight envelope for a pending or building job.
    pub fn in_flight(job: &BuildJob, queue_position: Option<u64>) -> Self {
        Self {
            request_hash: job.fingerprint.clone(),
            status: job.status,
            images: None,
            manifest: None,
            build_duration: None,
            cache_hit: None,
            queue_position,
            started_at: job.started_at,
            error_message: None,
        }
    }

    /// Terminal failure envelope.
    pub fn failed(job: &BuildJob) -> Self {
        Self {
            request_hash: job.fingerprint.clone(),
            status: JobStatus::Failed,
            images: None,
            manifest: None,
            build_duration: None,
            cache_hit: None,
            queue_position: None,
            started_at: job.started_at,
            error_message: job.error_message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prepare envelope
// ---------------------------------------------------------------------------

/// Response body for `POST /build/prepare`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Always `"prepared"`.
    pub status: String,
    /// The package list as submitted (canonicalized).
    pub original_packages: Vec<String>,
    /// The package list after resolution.
    pub resolved_packages: Vec<String>,
    /// Ordered audit log of resolver mutations.
    pub changes: Vec<PackageChange>,
    /// The request to submit for a verbatim build of `resolved_packages`.
    pub prepared_request: BuildRequest,
    /// Fingerprint of the canonical (original) request.
    pub request_hash: String,
    /// True when a cached result already exists for `request_hash`.
    pub cache_available: bool,
}

// ---------------------------------------------------------------------------
// Stats / health
// ---------------------------------------------------------------------------

/// Response body for `GET /stats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Number of PENDING jobs.
    pub queue_length: u64,
    /// Per-event counters.
    pub counters: std::collections::BTreeMap<String, i64>,
}
