// SPDX-License-Identifier: MIT OR Apache-2.0
//! Static rule tables keyed by version and by (target, subtarget, profile).
//!
//! Rules carry a `since` release floor; snapshot builds count as newer than
//! every release so they pick up all migrations.

/// Inclusive release floor, `(major, minor)`.
pub type Since = (u32, u32);

/// Comparable form of a version string.
///
/// `SNAPSHOT` (and `-SNAPSHOT` suffixes of a branch) sort after every
/// numbered release of that branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey {
    /// Release major, `u32::MAX` for the rolling snapshot.
    pub major: u32,
    /// Release minor.
    pub minor: u32,
}

impl VersionKey {
    /// Parse `24.10.0`, `23.05.0-rc2`, `24.10-SNAPSHOT`, or `SNAPSHOT`.
    ///
    /// Patch and rc components do not affect rule selection; only the branch
    /// does. Returns `None` for strings that passed request validation but
    /// carry no recognizable branch (should not happen in practice).
    pub fn parse(version: &str) -> Option<Self> {
        if version == "SNAPSHOT" {
            return Some(Self {
                major: u32::MAX,
                minor: u32::MAX,
            });
        }
        let branch = version.split('-').next()?;
        let mut parts = branch.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// True when this version is at or past the given floor.
    pub fn at_least(&self, since: Since) -> bool {
        (self.major, self.minor) >= since
    }
}

/// A package renamed or superseded from a given release on.
pub struct RenameRule {
    /// Release floor.
    pub since: Since,
    /// Old package name.
    pub from: &'static str,
    /// Replacement package name.
    pub to: &'static str,
    /// Audit-log explanation.
    pub reason: &'static str,
}

/// Renames and supersessions, applied before any additions.
pub const RENAMES: &[RenameRule] = &[
    RenameRule {
        since: (24, 10),
        from: "auc",
        to: "owut",
        reason: "auc replaced by owut",
    },
    RenameRule {
        since: (23, 5),
        from: "luci-ssl",
        to: "luci-ssl-nginx",
        reason: "luci-ssl deprecated in favor of luci-ssl-nginx",
    },
    RenameRule {
        since: (22, 3),
        from: "wpad-wolfssl",
        to: "wpad-mbedtls",
        reason: "wolfssl variants superseded by mbedtls",
    },
];

/// Language codes recognized for the i18n collapse.
const LANGUAGES: &[&str] = &[
    "ar", "bg", "ca", "cs", "da", "de", "el", "es", "fi", "fr", "he", "hi", "hu", "it", "ja", "ko",
    "mr", "ms", "nl", "no", "pl", "pt", "pt-br", "ro", "ru", "sk", "sv", "tr", "uk", "vi", "zh-cn",
    "zh-tw",
];

/// Release from which per-app language packs collapse into one umbrella
/// package per language.
pub const I18N_COLLAPSE_SINCE: Since = (24, 10);

/// If `package` is a per-app language pack (`luci-i18n-<app>-<lang>`),
/// return the umbrella package for its language (`luci-i18n-<lang>`).
pub fn i18n_umbrella(package: &str) -> Option<String> {
    let rest = package.strip_prefix("luci-i18n-")?;
    // The language code is the longest matching suffix; app names may
    // themselves contain hyphens.
    for lang in LANGUAGES {
        if let Some(app) = rest.strip_suffix(lang)
            && let Some(app) = app.strip_suffix('-')
            && !app.is_empty()
        {
            return Some(format!("luci-i18n-{lang}"));
        }
    }
    None
}

/// A device- or target-specific package requirement.
pub struct HardwareRule {
    /// Hardware family (before the slash).
    pub target: &'static str,
    /// Hardware variant (after the slash).
    pub subtarget: &'static str,
    /// Specific device, or `None` for the whole subtarget.
    pub profile: Option<&'static str>,
    /// Release floor, or `None` for all releases.
    pub since: Option<Since>,
    /// Packages to add.
    pub add: &'static [&'static str],
    /// Audit-log explanation.
    pub reason: &'static str,
}

/// Kernel modules and firmware a device needs but defaults omit.
pub const HARDWARE: &[HardwareRule] = &[
    HardwareRule {
        target: "mvebu",
        subtarget: "cortexa9",
        profile: Some("linksys_wrt3200acm"),
        since: Some((25, 12)),
        add: &["kmod-dsa-mv88e6xxx"],
        reason: "DSA switch driver required by profile",
    },
    HardwareRule {
        target: "ramips",
        subtarget: "mt7621",
        profile: None,
        since: Some((21, 2)),
        add: &["kmod-mt7530"],
        reason: "DSA switch driver required by target",
    },
    HardwareRule {
        target: "ipq806x",
        subtarget: "generic",
        profile: Some("netgear_r7800"),
        since: None,
        add: &["ath10k-firmware-qca9984-ct"],
        reason: "PHY firmware required by profile",
    },
];

/// Base-system packages merged back from the device defaults even when the
/// user supplies an absolute package list.
pub const BASE_PACKAGES: &[&str] = &[
    "base-files",
    "busybox",
    "ca-bundle",
    "dropbear",
    "firewall4",
    "fstools",
    "kmod-gpio-button-hotplug",
    "libc",
    "logd",
    "mtd",
    "netifd",
    "nftables",
    "opkg",
    "procd",
    "uboot-envtools",
    "uci",
    "uclient-fetch",
    "urandom-seed",
    "urngd",
];
