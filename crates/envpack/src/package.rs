//! Package records and list diffs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Packages with this prefix are shared runtime libraries. They stay in the
/// environment even when the toolchain that pulled them in is removed.
pub const RUNTIME_LIBRARY_PREFIX: &str = "lib";

/// Whether a package must never be removed with the toolchain.
pub fn is_runtime_library(name: &str) -> bool {
    name.starts_with(RUNTIME_LIBRARY_PREFIX)
}

/// One entry of an environment's package list (`conda list --json`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub build_string: Option<String>,

    #[serde(default)]
    pub channel: Option<String>,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PackageRecord {
            name: name.into(),
            version: version.into(),
            build_string: None,
            channel: None,
        }
    }
}

/// Package names added and removed by an operation.
///
/// Computed by name, so an upgraded or downgraded package counts as neither.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl PackageDiff {
    /// Diff two package lists. `None` on either side means the list was
    /// unavailable and is treated as "no change".
    pub fn between(before: Option<&[PackageRecord]>, after: Option<&[PackageRecord]>) -> Self {
        let (Some(before), Some(after)) = (before, after) else {
            return PackageDiff::default();
        };

        let before: BTreeSet<&str> = before.iter().map(|p| p.name.as_str()).collect();
        let after: BTreeSet<&str> = after.iter().map(|p| p.name.as_str()).collect();

        PackageDiff {
            added: after.difference(&before).map(|s| s.to_string()).collect(),
            removed: before.difference(&after).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Added packages that are safe to remove later.
    pub fn removable(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .filter(|name| !is_runtime_library(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(names: &[(&str, &str)]) -> Vec<PackageRecord> {
        names
            .iter()
            .map(|(n, v)| PackageRecord::new(*n, *v))
            .collect()
    }

    #[test]
    fn test_diff_added_and_removed() {
        let before = list(&[("python", "3.11"), ("zlib", "1.2")]);
        let after = list(&[("python", "3.11"), ("gcc", "13"), ("libgcc-ng", "13")]);

        let diff = PackageDiff::between(Some(&before), Some(&after));
        assert_eq!(
            diff.added.iter().cloned().collect::<Vec<_>>(),
            vec!["gcc".to_string(), "libgcc-ng".to_string()]
        );
        assert_eq!(
            diff.removed.iter().cloned().collect::<Vec<_>>(),
            vec!["zlib".to_string()]
        );
    }

    #[test]
    fn test_diff_ignores_version_changes() {
        let before = list(&[("python", "3.11.4")]);
        let after = list(&[("python", "3.11.6")]);
        assert!(PackageDiff::between(Some(&before), Some(&after)).is_empty());
    }

    #[test]
    fn test_diff_missing_list_is_no_change() {
        let after = list(&[("gcc", "13")]);
        assert!(PackageDiff::between(None, Some(&after)).is_empty());
        assert!(PackageDiff::between(Some(&after), None).is_empty());
    }

    #[test]
    fn test_removable_excludes_runtime_libraries() {
        let before = list(&[]);
        let after = list(&[("gcc", "13"), ("libstdcxx-ng", "13"), ("binutils", "2.40")]);
        let removable = PackageDiff::between(Some(&before), Some(&after)).removable();
        assert!(removable.contains("gcc"));
        assert!(removable.contains("binutils"));
        assert!(!removable.contains("libstdcxx-ng"));
    }

    #[test]
    fn test_package_record_from_conda_json() {
        let json = r#"[{"base_url":"https://conda.anaconda.org/conda-forge","build_number":0,
            "build_string":"h0b41bf4_3","channel":"conda-forge","dist_name":"zlib-1.2.13-h0b41bf4_3",
            "name":"zlib","platform":"linux-64","version":"1.2.13"}]"#;
        let records: Vec<PackageRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].name, "zlib");
        assert_eq!(records[0].channel.as_deref(), Some("conda-forge"));
    }
}
