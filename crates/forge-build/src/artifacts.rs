// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact discovery in the per-fingerprint blob directory.

use std::path::Path;
use walkdir::WalkDir;

/// File extensions the ImageBuilder emits for flashable images.
const IMAGE_EXTENSIONS: &[&str] = &["bin", "img", "gz", "trx"];

/// Walk `dir` and return image artifacts as sorted paths relative to `dir`.
///
/// Non-image files (json metadata, sha256sums, the injected `files/` subtree)
/// are skipped by the extension filter.
pub fn discover_artifacts(dir: &Path) -> Vec<String> {
    let mut artifacts: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
        })
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|rel| rel.to_string_lossy().into_owned())
        })
        .collect();
    artifacts.sort_unstable();
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn keeps_only_image_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("ath79/generic");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("fw-sysupgrade.bin"), b"x").unwrap();
        fs::write(nested.join("fw-factory.img"), b"x").unwrap();
        fs::write(nested.join("fw-rootfs.img.gz"), b"x").unwrap();
        fs::write(nested.join("profiles.json"), b"{}").unwrap();
        fs::write(nested.join("sha256sums"), b"x").unwrap();

        let artifacts = discover_artifacts(dir.path());
        assert_eq!(artifacts, vec![
            "ath79/generic/fw-factory.img",
            "ath79/generic/fw-rootfs.img.gz",
            "ath79/generic/fw-sysupgrade.bin",
        ]);
    }

    #[test]
    fn injected_defaults_tree_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files/etc/uci-defaults");
        fs::create_dir_all(&files).unwrap();
        fs::write(files.join("99-custom"), b"#!/bin/sh\n").unwrap();

        assert!(discover_artifacts(dir.path()).is_empty());
    }

    #[test]
    fn empty_directory_yields_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_artifacts(dir.path()).is_empty());
    }
}
