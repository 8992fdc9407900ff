//! Supported Kubernetes versions and upgrade path checks.

use std::collections::HashMap;

use anyhow::Result;
use semver::Version;

use crate::error::AkupError;

/// Kubernetes releases this tool can deploy on Azure Stack Hub.
const DEFAULT_SUPPORTED: &[&str] = &[
    "1.15.12", "1.16.14", "1.16.15", "1.17.11", "1.17.17", "1.18.10", "1.18.15", "1.18.18",
    "1.19.10", "1.19.15", "1.20.6", "1.20.11", "1.21.10", "1.22.7", "1.22.15", "1.23.6",
    "1.23.13", "1.24.7", "1.24.11",
];

/// Version support table, passed to the upgrade rather than read from global state.
#[derive(Debug, Clone)]
pub struct SupportedVersions {
    versions: HashMap<String, bool>,
}

impl Default for SupportedVersions {
    fn default() -> Self {
        Self::from_iter(DEFAULT_SUPPORTED.iter().map(|v| (v.to_string(), true)))
    }
}

impl FromIterator<(String, bool)> for SupportedVersions {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self {
            versions: iter.into_iter().collect(),
        }
    }
}

impl SupportedVersions {
    pub fn is_supported(&self, version: &str) -> bool {
        self.versions.get(version).copied().unwrap_or(false)
    }

    /// Check that `from` may be upgraded to `to`. `force` skips every check.
    ///
    /// The target must be newer than the current version, marked supported,
    /// and at most one minor release ahead.
    pub fn check_upgrade_path(&self, from: &str, to: &str, force: bool) -> Result<()> {
        if force {
            return Ok(());
        }

        let current = parse_version(from)?;
        let target = parse_version(to)?;

        if target <= current {
            return Err(AkupError::UnsupportedUpgrade {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let skips_minor = target.major != current.major || target.minor > current.minor + 1;
        if skips_minor || !self.is_supported(to) {
            return Err(AkupError::UpgradeNotAllowed {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Parse a Kubernetes version, tolerating a leading `v`.
pub fn parse_version(version: &str) -> Result<Version> {
    let trimmed = version.trim().trim_start_matches('v');
    Version::parse(trimmed).map_err(|_| AkupError::InvalidVersion(version.to_string()).into())
}

/// True if both strings name the same version. Unparseable versions compare as strings.
pub fn same_version(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}
