//! Single-writer exclusion by an atomic lock file next to the target.
//!
//! The lock is a sibling of the target directory named `<target>.lock`,
//! created with a single create-if-absent write. Its JSON content
//! identifies the owner and, once a transaction has opened its journal,
//! the journal directory. A lock left behind by a crashed writer is
//! never silently stolen; recovery (see the transaction module) only
//! acts when the owner is provably dead on this host.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::processor::CancelToken;
use crate::slice::poller::{poll, PollOutcome};

pub const LOCK_SUFFIX: &str = ".lock";

/// Content of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub start_time: String,
    /// URI of the owning transaction's journal directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_dir: Option<String>,
}

impl LockInfo {
    pub fn for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
            start_time: chrono::Utc::now().to_rfc3339(),
            txn_dir: None,
        }
    }
}

/// Held lock on a target. Released explicitly on commit or rollback;
/// dropping an unreleased lock removes the file as well, so an error
/// raised before a transaction starts does not leave a stale lock.
#[derive(Debug)]
pub struct TargetLock {
    file: FileObj,
    info: LockInfo,
    released: bool,
}

impl TargetLock {
    /// The lock file next to a target directory.
    pub fn lock_file(target_dir: &FileObj) -> FileObj {
        target_dir.sibling_with_suffix(LOCK_SUFFIX)
    }

    /// Acquire the lock. With `wait`, contention is retried at the given
    /// interval until the timeout elapses; without, it fails fast.
    pub fn acquire(
        target_dir: &FileObj,
        wait: Option<(Duration, Duration)>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let file = Self::lock_file(target_dir);
        let info = LockInfo::for_current_process();
        let content = serde_json::to_vec_pretty(&info)
            .map_err(|e| Error::internal(format!("cannot serialize lock info: {e}")))?;

        let try_acquire = |file: &FileObj| -> Result<Option<()>> {
            match file.write_new(&content) {
                Ok(()) => Ok(Some(())),
                Err(Error::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    Ok(None)
                }
                Err(other) => Err(other),
            }
        };

        let acquired = match wait {
            None => try_acquire(&file)?,
            Some((interval, timeout)) => {
                match poll(interval, timeout, cancel, || try_acquire(&file))? {
                    PollOutcome::Ready(()) => Some(()),
                    PollOutcome::TimedOut => None,
                }
            }
        };

        match acquired {
            Some(()) => {
                tracing::debug!("Acquired lock {}", file.uri());
                Ok(Self {
                    file,
                    info,
                    released: false,
                })
            }
            None => Err(Error::TargetLocked(file.uri().to_string())),
        }
    }

    /// Record the transaction journal directory in the lock file.
    pub fn set_txn_dir(&mut self, txn_dir_uri: &str) -> Result<()> {
        self.info.txn_dir = Some(txn_dir_uri.to_string());
        self.file.write_json(&self.info)
    }

    pub fn uri(&self) -> &str {
        self.file.uri()
    }

    /// Remove the lock file. Failure to remove is logged, not raised;
    /// the file is safe to delete manually.
    pub fn release(mut self) {
        self.released = true;
        remove_lock_file(&self.file);
    }

    /// Read the lock content next to a target, if a lock exists.
    pub fn read_info(target_dir: &FileObj) -> Result<Option<LockInfo>> {
        let file = Self::lock_file(target_dir);
        if !file.exists()? {
            return Ok(None);
        }
        match file.read_json() {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                tracing::warn!("Unreadable lock file {}: {e}", file.uri());
                Ok(Some(LockInfo {
                    pid: 0,
                    host: String::new(),
                    start_time: String::new(),
                    txn_dir: None,
                }))
            }
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if !self.released {
            remove_lock_file(&self.file);
        }
    }
}

fn remove_lock_file(file: &FileObj) {
    if let Err(e) = file.delete_if_exists(false) {
        tracing::warn!("Failed to remove target lock {}: {e}", file.uri());
        tracing::warn!("Note, it should be safe to delete it manually.");
    }
}

fn hostname() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Whether a process id is alive on this host. Errs on the side of
/// "alive" where it cannot tell, so locks are never stolen by mistake.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    if cfg!(target_os = "linux") {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}
