// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit records emitted by the resolver.

use serde::{Deserialize, Serialize};

/// Which rule family produced a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Version-range migration (rename, removal, language collapse).
    Migration,
    /// Hardware-specific addition keyed by target/subtarget/profile.
    Hardware,
    /// Default-package reconciliation.
    Defaults,
    /// User-supplied version pin.
    Pin,
}

/// What happened to the package set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    /// A package was added.
    Add {
        /// The added package.
        package: String,
    },
    /// A package was removed.
    Remove {
        /// The removed package.
        package: String,
    },
    /// A package was replaced by another.
    Replace {
        /// The package that was dropped.
        from_package: String,
        /// The package that took its place.
        to_package: String,
    },
    /// A package version was pinned.
    Pin {
        /// The pinned package.
        package: String,
        /// The requested version.
        version: String,
    },
}

/// One entry of the resolver's ordered audit log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    /// Rule family that produced the change.
    #[serde(rename = "type")]
    pub source: ChangeSource,
    /// The concrete mutation.
    #[serde(flatten)]
    pub action: ChangeAction,
    /// Human-readable explanation.
    pub reason: String,
    /// True when a rule applied the change without user involvement.
    pub automatic: bool,
}

impl PackageChange {
    /// Shorthand for an automatic migration replace.
    pub fn migration_replace(from: &str, to: &str, reason: impl Into<String>) -> Self {
        Self {
            source: ChangeSource::Migration,
            action: ChangeAction::Replace {
                from_package: from.to_string(),
                to_package: to.to_string(),
            },
            reason: reason.into(),
            automatic: true,
        }
    }
}
