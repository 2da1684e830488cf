// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP build API for imageforge.
//!
//! Three operations drive the core: `submit` (canonicalize, consult cache and
//! queue, admit), `status` (poll by fingerprint), and `prepare` (pure
//! resolver preview, no job). API operations never wait on builds; they
//! either answer immediately or hand back the fingerprint as a poll token.

#![deny(unsafe_code)]

mod api;

pub use api::{ApiError, BuildStatusResponse, PrepareResponse, StatsResponse};

use axum::response::IntoResponse;
use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    routing::{get, post},
};
use forge_core::{BuildRequest, JobStatus, ValidationLimits, canonicalize, fingerprint};
use forge_store::{EnqueueOutcome, JobStore, StoreError};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Shared state behind the router.
pub struct AppState {
    /// The job store.
    pub store: Arc<JobStore>,
    /// Worker wakeup, signalled once per admission.
    pub notify: Arc<Notify>,
    /// Validation caps from the configuration.
    pub limits: ValidationLimits,
    /// Admission cap on the PENDING backlog.
    pub max_pending_jobs: usize,
}

/// Build the axum router with all API routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/stats", get(cmd_stats))
        .route("/build", post(cmd_submit))
        .route("/build/prepare", post(cmd_prepare))
        .route("/build/{fingerprint}", get(cmd_status))
        .with_state(state)
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_length": state.store.queue_length()?,
    })))
}

async fn cmd_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        queue_length: state.store.queue_length()?,
        counters: state.store.counters()?,
    }))
}

/// `POST /build` — canonicalize, consult cache and queue, admit.
async fn cmd_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> Result<axum::response::Response, ApiError> {
    let canonical =
        canonicalize(req, &state.limits).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let request_hash = fingerprint(&canonical);

    // Cache fast path: identical request already built.
    if let Some(result) = state.store.get_result(&request_hash)? {
        state.store.increment_counter("cache-hits")?;
        debug!(fingerprint = %request_hash, "cache hit");
        let body = BuildStatusResponse::completed(&result.as_cache_hit());
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    // In-flight or cached-failure fast path.
    if let Some(job) = state.store.get_job(&request_hash)? {
        match job.status {
            JobStatus::Pending | JobStatus::Building => {
                let position = state.store.queue_position(&request_hash)?;
                let body = BuildStatusResponse::in_flight(&job, position);
                return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
            }
            JobStatus::Failed => {
                // Failures stay cached until their TTL sweeps them.
                let body = BuildStatusResponse::failed(&job);
                return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response());
            }
            // A terminal job without a result only happens mid-expiry;
            // fall through and admit a fresh build.
            JobStatus::Completed => {}
        }
    }

    // Admission control.
    if state.store.queue_length()? >= state.max_pending_jobs as u64 {
        state.store.increment_counter("requests-rejected")?;
        return Err(ApiError::too_many_requests("build queue is full"));
    }

    state.store.put_request(&request_hash, &canonical)?;
    match state.store.enqueue(&request_hash)? {
        EnqueueOutcome::New => {
            state.store.increment_counter("builds-requested")?;
            state.notify.notify_one();
            info!(
                fingerprint = %request_hash,
                client = canonical.client.as_deref().unwrap_or("-"),
                "build admitted"
            );
        }
        // Lost a race with an identical concurrent submission; the caller
        // becomes a subscriber of that job.
        EnqueueOutcome::AlreadyInFlight => {}
        // A result landed between the fast path and admission.
        EnqueueOutcome::AlreadyBuilt => {
            if let Some(result) = state.store.get_result(&request_hash)? {
                state.store.increment_counter("cache-hits")?;
                let body = BuildStatusResponse::completed(&result.as_cache_hit());
                return Ok((StatusCode::OK, Json(body)).into_response());
            }
        }
    }

    let job = state
        .store
        .get_job(&request_hash)?
        .ok_or_else(|| ApiError::internal("job vanished after admission"))?;
    let position = state.store.queue_position(&request_hash)?;
    let body = BuildStatusResponse::in_flight(&job, position);
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// `GET /build/{fingerprint}` — poll a build by its fingerprint.
async fn cmd_status(
    State(state): State<Arc<AppState>>,
    AxPath(request_hash): AxPath<String>,
) -> Result<axum::response::Response, ApiError> {
    if let Some(result) = state.store.get_result(&request_hash)? {
        let body = BuildStatusResponse::completed(&result);
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    match state.store.get_job(&request_hash)? {
        Some(job) if job.status == JobStatus::Failed => {
            let body = BuildStatusResponse::failed(&job);
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
        }
        Some(job) if !job.status.is_terminal() => {
            let position = state.store.queue_position(&request_hash)?;
            let body = BuildStatusResponse::in_flight(&job, position);
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        _ => Err(ApiError::not_found("unknown fingerprint")),
    }
}

/// `POST /build/prepare` — resolver preview; touches no queue state.
async fn cmd_prepare(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> Result<Json<PrepareResponse>, ApiError> {
    let canonical =
        canonicalize(req, &state.limits).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let request_hash = fingerprint(&canonical);

    // The prepare path is pure: no probe, so resolution runs against an
    // empty default set.
    let resolution = forge_resolver::resolve(&canonical, &BTreeSet::new())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut prepared_request = canonical.clone();
    prepared_request.packages = resolution.packages.clone();
    prepared_request.skip_package_resolution = true;

    let cache_available = state.store.get_result(&request_hash)?.is_some();

    Ok(Json(PrepareResponse {
        status: "prepared".into(),
        original_packages: canonical.packages,
        resolved_packages: resolution.packages,
        changes: resolution.changes,
        prepared_request,
        request_hash,
        cache_available,
    }))
}
