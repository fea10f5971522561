//! Full `git clone` of every listed repository, one at a time.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// Directory name for a repository: `owner/name` becomes `owner__name`
pub fn target_dir_name(full_name: &str) -> String {
    full_name.trim().replace(['/', '\\'], "__")
}

/// Runs the actual clone
pub trait CloneRunner {
    fn clone_repo(&self, url: &str, target: &Path) -> Result<()>;
}

/// Invokes the `git` binary
pub struct GitCli;

impl CloneRunner for GitCli {
    fn clone_repo(&self, url: &str, target: &Path) -> Result<()> {
        let status = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(target)
            .stdin(Stdio::null())
            .status()
            .context("Failed to run git")?;

        if !status.success() {
            bail!("git clone exited with {}", status);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneStats {
    pub cloned: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Clone every identifier into `clone_dir`, skipping targets that already
/// exist. Failures are logged and the run continues.
pub fn clone_all(
    runner: &dyn CloneRunner,
    ids: &[String],
    clone_dir: &Path,
    delay: Duration,
) -> Result<CloneStats> {
    std::fs::create_dir_all(clone_dir)
        .with_context(|| format!("Failed to create clone directory: {}", clone_dir.display()))?;

    let mut stats = CloneStats::default();
    let mut done = HashSet::new();

    for full_name in ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !done.insert(full_name) {
            continue;
        }

        let target: PathBuf = clone_dir.join(target_dir_name(full_name));
        if target.exists() {
            info!(repo = full_name, "already cloned");
            stats.skipped += 1;
            continue;
        }

        let url = format!("https://github.com/{}.git", full_name);
        info!(repo = full_name, "cloning");
        match runner.clone_repo(&url, &target) {
            Ok(()) => stats.cloned += 1,
            Err(e) => {
                warn!(repo = full_name, error = %e, "clone failed");
                stats.failed += 1;
            }
        }

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    Ok(stats)
}

/// [`clone_all`] on tokio's blocking pool, so `git` and the pauses between
/// clones never stall an async worker
pub async fn clone_all_blocking<R>(
    runner: R,
    ids: Vec<String>,
    clone_dir: PathBuf,
    delay: Duration,
) -> Result<CloneStats>
where
    R: CloneRunner + Send + 'static,
{
    tokio::task::spawn_blocking(move || clone_all(&runner, &ids, &clone_dir, delay))
        .await
        .context("Clone task failed")?
}
