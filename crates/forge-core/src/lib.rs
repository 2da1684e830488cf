// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the imageforge build service.
//!
//! This crate defines [`BuildRequest`], the canonical declarative input,
//! together with its validation rules, the canonicalization pass that makes
//! semantically equivalent requests byte-identical, and the SHA-256
//! [`fingerprint`](canonical::fingerprint) that drives deduplication, cache
//! lookup, and job identity across the rest of the system.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod job;
mod request;
mod result;

pub use canonical::{canonicalize, fingerprint};
pub use job::{BuildJob, JobStatus};
pub use request::{BuildRequest, ValidationError, ValidationLimits};
pub use result::BuildResult;
