//! Manifest discovery.
//!
//! Walks the examples tree and returns every manifest that should become a
//! case, in a stable order.

use crate::error::{HarnessError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::{DirEntry, WalkDir};

/// Directories holding manifests that cannot run in CI.
const NO_CI_DIR: &str = "no-ci";

const MANIFEST_EXTENSION: &str = "yaml";

/// Every `.yaml` manifest under `root`, sorted by path.
///
/// `no-ci` directories are pruned with their whole subtree. Paths matching
/// `ignore` are logged and left out. Any traversal error aborts enumeration.
pub fn manifest_paths(root: &Path, ignore: Option<&Regex>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_no_ci_dir(entry));

    for entry in walker {
        let entry = entry.map_err(|e| HarnessError::Enumeration {
            path: e.path().unwrap_or(root).to_path_buf(),
            message: e.to_string(),
        })?;

        if !entry.file_type().is_file() || !is_manifest(entry.path()) {
            continue;
        }

        let path = entry.into_path();
        let shown = path.display().to_string();
        if ignore.is_some_and(|pattern| pattern.is_match(&shown)) {
            info!(manifest = %shown, "Skipping test");
            continue;
        }

        info!(manifest = %shown, "Adding test");
        paths.push(path);
    }

    Ok(paths)
}

/// Case name for `path`: its path under `root` without the extension.
pub fn test_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_no_ci_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.depth() > 0 && entry.file_name() == NO_CI_DIR
}

fn is_manifest(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION)
}
