//! README extraction from cloned repositories.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::scanner::list_repositories;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadmeStats {
    pub saved: usize,
    pub missing: usize,
}

/// First top-level file whose lowercase name starts with `readme`
pub fn find_readme(repo: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(repo)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().to_lowercase().starts_with("readme"))
        .map(|e| e.path())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Save each repository's README as `{out}/{repository}.txt`
pub fn extract_readmes(root: &Path, out: &Path) -> Result<ReadmeStats> {
    let repos = list_repositories(root)?;
    fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;

    let mut stats = ReadmeStats::default();
    for (name, path) in repos {
        let Some(readme) = find_readme(&path) else {
            info!(repo = %name, "no README found");
            stats.missing += 1;
            continue;
        };

        let content = match fs::read(&readme) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(repo = %name, error = %e, "unreadable README");
                stats.missing += 1;
                continue;
            }
        };

        let dest = out.join(format!("{}.txt", name));
        fs::write(&dest, content).with_context(|| format!("Failed to write {}", dest.display()))?;
        stats.saved += 1;
    }
    Ok(stats)
}
