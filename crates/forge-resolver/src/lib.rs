// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic package resolution for imageforge.
//!
//! The resolver turns a user-supplied package list into the final list handed
//! to the ImageBuilder. It is pure: identical inputs yield identical outputs,
//! and it never touches the filesystem or the network. Every mutation is
//! recorded as an ordered [`PackageChange`] so clients can preview what a
//! build will actually contain.
//!
//! Rule ordering: version migrations apply first, then hardware-specific
//! additions, then version pins. A pin always wins: a migration never
//! renames or removes a pinned package.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
pub mod rules;

pub use change::{ChangeAction, ChangeSource, PackageChange};

use forge_core::BuildRequest;
use rules::{BASE_PACKAGES, HARDWARE, I18N_COLLAPSE_SINCE, RENAMES, VersionKey, i18n_umbrella};
use std::collections::BTreeSet;

/// Resolution failures. Surfaced as `400` on the prepare path and as a
/// `resolve`-phase job failure during builds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    /// The version string carries no recognizable release branch.
    #[error("unrecognized version: '{0}'")]
    UnrecognizedVersion(String),

    /// A `-name` removal referenced a package that is not in the set being
    /// built.
    #[error("removal of '{0}' does not match any default or requested package")]
    RemovalOfUnknown(String),

    /// Resolution produced an empty package set.
    #[error("resolution produced an empty package set")]
    EmptySet,
}

/// Outcome of a resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Final package list, sorted, ready for the ImageBuilder.
    pub packages: Vec<String>,
    /// Ordered audit log of every mutation.
    pub changes: Vec<PackageChange>,
}

/// Resolve `request.packages` against the device's default package set.
///
/// `defaults` is the set reported by the ImageBuilder's `make info` for this
/// (version, target, profile); the prepare path passes an empty set.
///
/// Applying the resolver to its own output with the same defaults yields
/// zero further changes.
pub fn resolve(
    request: &BuildRequest,
    defaults: &BTreeSet<String>,
) -> Result<Resolution, ResolverError> {
    let version = VersionKey::parse(&request.version)
        .ok_or_else(|| ResolverError::UnrecognizedVersion(request.version.clone()))?;

    let mut changes = Vec::new();

    // Split the user list into requested packages and explicit removals.
    let mut requested: BTreeSet<String> = BTreeSet::new();
    let mut removals: BTreeSet<String> = BTreeSet::new();
    for pkg in &request.packages {
        // A leading dash is a removal; outside diff mode it subtracts from
        // the merged defaults instead of the delta.
        match pkg.strip_prefix('-') {
            Some(name) => {
                removals.insert(name.to_string());
            }
            None => {
                requested.insert(pkg.clone());
            }
        }
    }

    // -- Version migrations (renames before anything else) -------------------
    let pinned = &request.packages_versions;
    for rule in RENAMES {
        if !version.at_least(rule.since) || !requested.contains(rule.from) {
            continue;
        }
        if pinned.contains_key(rule.from) {
            // Pin wins; leave the old package in place.
            continue;
        }
        requested.remove(rule.from);
        if requested.contains(rule.to) {
            changes.push(PackageChange {
                source: ChangeSource::Migration,
                action: ChangeAction::Replace {
                    from_package: rule.from.to_string(),
                    to_package: rule.to.to_string(),
                },
                reason: "duplicate collapsed".into(),
                automatic: true,
            });
        } else {
            requested.insert(rule.to.to_string());
            changes.push(PackageChange::migration_replace(
                rule.from, rule.to, rule.reason,
            ));
        }
    }

    // Per-app language packs collapse to one umbrella per language.
    if version.at_least(I18N_COLLAPSE_SINCE) {
        let per_app: Vec<(String, String)> = requested
            .iter()
            .filter(|p| !pinned.contains_key(*p))
            .filter_map(|p| i18n_umbrella(p).map(|u| (p.clone(), u)))
            .collect();
        for (from, to) in per_app {
            requested.remove(&from);
            let fresh = requested.insert(to.clone());
            changes.push(PackageChange {
                source: ChangeSource::Migration,
                action: ChangeAction::Replace {
                    from_package: from,
                    to_package: to,
                },
                reason: if fresh {
                    "language packs collapsed to umbrella package".into()
                } else {
                    "duplicate collapsed".into()
                },
                automatic: true,
            });
        }
    }

    // -- Default reconciliation ----------------------------------------------
    let mut merged: BTreeSet<String> = if request.diff_packages {
        // Delta over the device's default set.
        defaults.union(&requested).cloned().collect()
    } else {
        // Absolute list, with base-system packages restored from defaults.
        let mut set = requested.clone();
        for pkg in defaults {
            if BASE_PACKAGES.contains(&pkg.as_str()) && set.insert(pkg.clone()) {
                changes.push(PackageChange {
                    source: ChangeSource::Defaults,
                    action: ChangeAction::Add {
                        package: pkg.clone(),
                    },
                    reason: "base system package retained from defaults".into(),
                    automatic: true,
                });
            }
        }
        set
    };

    for name in &removals {
        if !merged.remove(name) {
            return Err(ResolverError::RemovalOfUnknown(name.clone()));
        }
        changes.push(PackageChange {
            source: ChangeSource::Defaults,
            action: ChangeAction::Remove {
                package: name.clone(),
            },
            reason: "excluded by request".into(),
            automatic: false,
        });
    }

    // -- Hardware-specific additions -----------------------------------------
    let (target, subtarget) = (request.target_name(), request.subtarget());
    for rule in HARDWARE {
        if rule.target != target || rule.subtarget != subtarget {
            continue;
        }
        if let Some(profile) = rule.profile
            && profile != request.profile
        {
            continue;
        }
        if let Some(since) = rule.since
            && !version.at_least(since)
        {
            continue;
        }
        for pkg in rule.add {
            if merged.insert(pkg.to_string()) {
                changes.push(PackageChange {
                    source: ChangeSource::Hardware,
                    action: ChangeAction::Add {
                        package: pkg.to_string(),
                    },
                    reason: rule.reason.into(),
                    automatic: true,
                });
            }
        }
    }

    // -- Pins (last, so an explicit user pin always wins) --------------------
    for (name, pin_version) in pinned {
        if merged.insert(name.clone()) {
            changes.push(PackageChange {
                source: ChangeSource::Pin,
                action: ChangeAction::Pin {
                    package: name.clone(),
                    version: pin_version.clone(),
                },
                reason: "added by version pin".into(),
                automatic: false,
            });
        }
    }

    if merged.is_empty() {
        return Err(ResolverError::EmptySet);
    }

    Ok(Resolution {
        packages: merged.into_iter().collect(),
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn request(version: &str, target: &str, profile: &str, packages: &[&str]) -> BuildRequest {
        BuildRequest {
            distribution: "openwrt".into(),
            version: version.into(),
            target: target.into(),
            profile: profile.into(),
            packages: packages.iter().map(|s| s.to_string()).collect(),
            packages_versions: BTreeMap::new(),
            diff_packages: false,
            skip_package_resolution: false,
            defaults: None,
            rootfs_size_mb: None,
            repositories: vec![],
            repository_keys: vec![],
            client: None,
            created_at: Utc::now(),
        }
    }

    fn defaults(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn auc_renamed_to_owut_from_24_10() {
        let req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "luci", "auc",
        ]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["luci", "owut"]);
        assert_eq!(res.changes.len(), 1);
        assert_eq!(
            res.changes[0],
            PackageChange::migration_replace("auc", "owut", "auc replaced by owut")
        );
    }

    #[test]
    fn auc_untouched_before_24_10() {
        let req = request("23.05.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "luci", "auc",
        ]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["auc", "luci"]);
        assert!(res.changes.is_empty());
    }

    #[test]
    fn rename_collapses_duplicate_when_target_already_requested() {
        let req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "auc", "owut",
        ]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["owut"]);
        assert_eq!(res.changes.len(), 1);
        assert_eq!(res.changes[0].reason, "duplicate collapsed");
    }

    #[test]
    fn pin_suppresses_migration() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &["auc"]);
        req.packages_versions.insert("auc".into(), "0.3.2".into());
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["auc"]);
        assert!(res.changes.is_empty());
    }

    #[test]
    fn pin_of_absent_package_adds_it() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &["luci"]);
        req.packages_versions.insert("tmux".into(), "3.5".into());
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["luci", "tmux"]);
        assert_eq!(res.changes.len(), 1);
        assert!(matches!(
            &res.changes[0].action,
            ChangeAction::Pin { package, version } if package == "tmux" && version == "3.5"
        ));
    }

    #[test]
    fn language_packs_collapse_to_umbrella() {
        let req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "luci",
            "luci-i18n-firewall-de",
            "luci-i18n-opkg-de",
        ]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert_eq!(res.packages, vec!["luci", "luci-i18n-de"]);
        // First collapse renames, second collapses onto the existing umbrella.
        assert_eq!(res.changes.len(), 2);
        assert_eq!(res.changes[1].reason, "duplicate collapsed");
    }

    #[test]
    fn dsa_module_added_for_profile_in_25_12() {
        let req = request("25.12.0", "mvebu/cortexa9", "linksys_wrt3200acm", &["luci"]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert!(res.packages.contains(&"kmod-dsa-mv88e6xxx".to_string()));
        let add = res
            .changes
            .iter()
            .find(|c| matches!(&c.action, ChangeAction::Add { package } if package == "kmod-dsa-mv88e6xxx"))
            .expect("hardware add recorded");
        assert!(add.reason.contains("required by profile"));
        assert!(add.automatic);
    }

    #[test]
    fn dsa_module_not_added_before_25_12() {
        let req = request("24.10.0", "mvebu/cortexa9", "linksys_wrt3200acm", &["luci"]);
        let res = resolve(&req, &BTreeSet::new()).unwrap();
        assert!(!res.packages.contains(&"kmod-dsa-mv88e6xxx".to_string()));
    }

    #[test]
    fn diff_mode_unions_defaults_and_delta() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &["tmux"]);
        req.diff_packages = true;
        let res = resolve(&req, &defaults(&["base-files", "dropbear", "ppp"])).unwrap();
        assert_eq!(res.packages, vec!["base-files", "dropbear", "ppp", "tmux"]);
    }

    #[test]
    fn diff_mode_removals_subtract_from_union() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "tmux", "-ppp",
        ]);
        req.diff_packages = true;
        let res = resolve(&req, &defaults(&["base-files", "ppp"])).unwrap();
        assert_eq!(res.packages, vec!["base-files", "tmux"]);
        assert!(res.changes.iter().any(|c| matches!(
            &c.action,
            ChangeAction::Remove { package } if package == "ppp"
        )));
    }

    #[test]
    fn removal_of_unknown_package_is_an_error() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &[
            "-nonexistent",
        ]);
        req.diff_packages = true;
        let err = resolve(&req, &defaults(&["base-files"])).unwrap_err();
        assert_eq!(err, ResolverError::RemovalOfUnknown("nonexistent".into()));
    }

    #[test]
    fn absolute_mode_restores_base_packages_only() {
        let req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &["luci"]);
        let res = resolve(&req, &defaults(&["base-files", "dropbear", "ppp"])).unwrap();
        // ppp is a default but not base-system; it is dropped in absolute mode.
        assert_eq!(res.packages, vec!["base-files", "dropbear", "luci"]);
        assert_eq!(
            res.changes
                .iter()
                .filter(|c| c.source == ChangeSource::Defaults)
                .count(),
            2
        );
    }

    #[test]
    fn empty_resolution_is_an_error() {
        let mut req = request("24.10.0", "ath79/generic", "tplink_archer-c7-v5", &["-luci"]);
        req.diff_packages = true;
        let err = resolve(&req, &defaults(&["luci"])).unwrap_err();
        assert_eq!(err, ResolverError::EmptySet);
    }

    #[test]
    fn resolver_is_idempotent() {
        let base = defaults(&["base-files", "dropbear", "ppp"]);
        let mut req = request("24.10.0", "mvebu/cortexa9", "linksys_wrt3200acm", &[
            "auc",
            "luci-i18n-firewall-de",
            "tmux",
            "-ppp",
        ]);
        req.diff_packages = true;
        let first = resolve(&req, &base).unwrap();
        assert!(!first.changes.is_empty());

        // The output is an absolute set; a re-resolution is no longer a delta.
        let mut again = req.clone();
        again.packages = first.packages.clone();
        again.diff_packages = false;
        let second = resolve(&again, &base).unwrap();
        assert_eq!(second.packages, first.packages);
        assert!(second.changes.is_empty(), "second pass: {:?}", second.changes);
    }

    #[test]
    fn identical_inputs_identical_outputs() {
        let base = defaults(&["base-files"]);
        let req = request("24.10.0", "ramips/mt7621", "xiaomi_mi-router-4a-gigabit", &[
            "luci", "auc",
        ]);
        let a = resolve(&req, &base).unwrap();
        let b = resolve(&req, &base).unwrap();
        assert_eq!(a, b);
    }
}
