//! Stack-level run lock.
//!
//! Two orchestrators executing against the same stack root would interleave
//! helm operations and corrupt each other's run stores. The lock file at
//! `<stack_root>/.ktl/stack/lock` holds JSON metadata about the holder;
//! stale locks (older than the timeout) are reclaimed so a crashed run does
//! not wedge the stack forever.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Held lock; released (best-effort) on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn lock_path(stack_root: &Path) -> PathBuf {
        stack_root.join(".ktl").join("stack").join(LOCK_FILE)
    }

    /// Acquire the lock for a stack root, reclaiming a stale one.
    ///
    /// A lock is stale when it is older than `stale_after` or was taken by
    /// this same process (a crashed-and-restarted in-process retry).
    pub fn acquire(stack_root: &Path, run_id: &str, stale_after: Duration) -> Result<Self> {
        let path = Self::lock_path(stack_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        if path.exists() {
            let existing = Self::read_info(&path)?;
            let age = Utc::now().signed_duration_since(existing.acquired_at);
            let stale = age
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(true)
                || existing.pid == std::process::id();
            if !stale {
                bail!(
                    "stack is locked by pid {} on {} since {} (run {}); \
                     wait for it to finish or remove {}",
                    existing.pid,
                    existing.hostname,
                    existing.acquired_at,
                    existing.run_id.as_deref().unwrap_or("unknown"),
                    path.display()
                );
            }
            fs::remove_file(&path)
                .with_context(|| format!("failed to reclaim stale lock {}", path.display()))?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            run_id: Some(run_id.to_string()),
        };

        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create lock tmp file {}", tmp.display()))?;
            file.write_all(json.as_bytes())
                .context("failed to write lock info")?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move lock into place {}", path.display()))?;

        Ok(Self { path })
    }

    fn read_info(path: &Path) -> Result<LockInfo> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lock file {}", path.display()))
    }

    /// Current holder, if any.
    pub fn holder(stack_root: &Path) -> Result<Option<LockInfo>> {
        let path = Self::lock_path(stack_root);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_info(&path).map(Some)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
