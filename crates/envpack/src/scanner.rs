//! Dependency file scanning.
//!
//! Flags conda environment files that embed a nested `pip:` dependency list.
//! Those entries are resolved by pip inside the environment and may need a
//! compiler, so the pipeline treats them specially. This is a line scan, not
//! a YAML parse.

use crate::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Whether `line` opens a nested pip list: `- pip:` with nothing after the colon.
pub fn is_pip_list_marker(line: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix('-') else {
        return false;
    };
    let Some(rest) = rest.trim_start().strip_prefix("pip:") else {
        return false;
    };
    rest.trim().is_empty()
}

/// Whether any line of `content` is a pip list marker.
pub fn contains_risky_dependency(content: &str) -> bool {
    content.lines().any(is_pip_list_marker)
}

/// Read `file` and report whether it declares an embedded pip list.
pub fn has_risky_dependency(file: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(file)?;
    Ok(contains_risky_dependency(&content))
}

/// Return the subset of `files` (order preserved) with embedded pip lists,
/// warning once per flagged file.
pub fn scan_files(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut flagged = Vec::new();
    for file in files {
        if has_risky_dependency(file)? {
            warn!(
                file = %file.display(),
                "pip dependencies found; they will be resolved with a compiler toolchain present"
            );
            flagged.push(file.clone());
        }
    }
    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pip_marker_matches() {
        assert!(is_pip_list_marker("  - pip:"));
        assert!(is_pip_list_marker("  - pip:   "));
        assert!(is_pip_list_marker("- pip:"));
        assert!(is_pip_list_marker("\t-   pip:\t"));
    }

    #[test]
    fn test_pip_marker_rejects() {
        assert!(!is_pip_list_marker("  - pip: 1.0"));
        assert!(!is_pip_list_marker("  - numpy"));
        assert!(!is_pip_list_marker("pip:"));
        assert!(!is_pip_list_marker("  - pip"));
        assert!(!is_pip_list_marker("  - pip=23.0"));
        assert!(!is_pip_list_marker("  - pipx:"));
    }

    #[test]
    fn test_contains_risky_dependency() {
        let risky = "name: demo\ndependencies:\n  - python=3.11\n  - pip:\n    - requests\n";
        let plain = "name: demo\ndependencies:\n  - python=3.11\n  - pip\n";
        assert!(contains_risky_dependency(risky));
        assert!(!contains_risky_dependency(plain));
    }

    #[test]
    fn test_scan_files_preserves_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.yml");
        let b = dir.path().join("b.yml");
        let c = dir.path().join("c.yml");
        std::fs::write(&a, "dependencies:\n  - pip:\n    - x\n").unwrap();
        std::fs::write(&b, "dependencies:\n  - numpy\n").unwrap();
        std::fs::write(&c, "dependencies:\n  - pip:\n    - y\n").unwrap();

        let flagged = scan_files(&[a.clone(), b, c.clone()]).unwrap();
        assert_eq!(flagged, vec![a, c]);
    }

    #[test]
    fn test_scan_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(scan_files(&[dir.path().join("missing.yml")]).is_err());
    }
}
