// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue entries and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a build job.
///
/// Jobs only ever move forward: `Pending → Building → {Completed, Failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and waiting for a worker.
    Pending,
    /// Claimed by a worker; a container is (or will shortly be) running.
    Building,
    /// Finished with at least one published artifact.
    Completed,
    /// Finished without a usable result.
    Failed,
}

impl JobStatus {
    /// Returns `true` for states with no valid successor.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The set of statuses that may follow `self`.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Building],
            Self::Building => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Returns `true` if `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable string form used in the database and API envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "building" => Some(Self::Building),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued or running build, keyed by request fingerprint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildJob {
    /// Fingerprint of the canonical request this job builds.
    pub fingerprint: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Monotonic admission sequence; earlier numbers dispatch first.
    pub queue_seq: i64,
    /// When the job entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// When a worker claimed the job.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Identifier of the worker that claimed the job.
    pub worker: Option<String>,
    /// The ImageBuilder command line, recorded for diagnostics.
    pub build_cmd: Option<String>,
    /// Phase-tagged failure message for FAILED jobs.
    pub error_message: Option<String>,
}
