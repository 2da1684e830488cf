// SPDX-License-Identifier: MIT OR Apache-2.0
//! ImageBuilder addressing and `make info` output parsing.

use std::collections::BTreeSet;

/// Container image tag for an ImageBuilder:
/// `<registry>:<version>-<target>-<subtarget>`.
pub fn image_tag(registry: &str, version: &str, target: &str, subtarget: &str) -> String {
    format!("{registry}:{version}-{target}-{subtarget}")
}

/// Extract the default package set from `make info` output.
///
/// The line beginning `Default Packages:` is tokenized by whitespace; an
/// absent line means an empty default set.
pub fn parse_default_packages(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Default Packages:"))
        .map(|rest| rest.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
