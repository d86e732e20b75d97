//! Cross-process advisory locks serializing access to one shared repository.
//!
//! Each `(repository path, domain)` pair maps to one lock file under a shared
//! directory. Any process naming the same repository contends on the same
//! file, and the OS drops the lock when a holder exits.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{EnvError, EnvResult};
use crate::io::config::Settings;

/// Independent serialization scopes for repository operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockDomain {
    /// Remote and fork setup.
    Repo,
    /// Branch and worktree creation.
    Worktree,
    /// State saves and history appends.
    Notes,
}

impl LockDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            LockDomain::Repo => "repo",
            LockDomain::Worktree => "worktree",
            LockDomain::Notes => "notes",
        }
    }
}

impl fmt::Display for LockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Exclusive,
    Shared,
}

/// Hands out lock managers sharing one lock directory and poll interval.
#[derive(Debug, Clone)]
pub struct RepositoryLocks {
    lock_dir: PathBuf,
    poll_interval: Duration,
}

impl RepositoryLocks {
    pub fn new(lock_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            poll_interval,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.lock_dir(), settings.lock_poll_interval())
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock manager for `repo`, keyed by its absolute path.
    pub fn for_repo(&self, repo: &Path) -> EnvResult<RepositoryLockManager> {
        let absolute = match fs::canonicalize(repo) {
            Ok(path) => path,
            Err(_) => std::path::absolute(repo)
                .with_context(|| format!("resolve repository path {}", repo.display()))?,
        };
        Ok(RepositoryLockManager {
            repo: absolute,
            lock_dir: self.lock_dir.clone(),
            poll_interval: self.poll_interval,
        })
    }
}

/// Locks for one repository.
#[derive(Debug, Clone)]
pub struct RepositoryLockManager {
    repo: PathBuf,
    lock_dir: PathBuf,
    poll_interval: Duration,
}

impl RepositoryLockManager {
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn lock_path(&self, domain: LockDomain) -> PathBuf {
        let hash = fnv1a(self.repo.to_string_lossy().as_bytes());
        self.lock_dir
            .join(format!("agentenv-{hash:08x}-{}.lock", domain.as_str()))
    }

    /// Acquire `domain` exclusively, polling until `cancel` is done.
    pub fn lock(&self, domain: LockDomain, cancel: &CancelToken) -> EnvResult<RepositoryLockGuard> {
        self.acquire(domain, LockKind::Exclusive, cancel)
    }

    /// Acquire `domain` shared with other readers, polling until `cancel` is done.
    pub fn rlock(
        &self,
        domain: LockDomain,
        cancel: &CancelToken,
    ) -> EnvResult<RepositoryLockGuard> {
        self.acquire(domain, LockKind::Shared, cancel)
    }

    /// Run `f` while holding `domain` exclusively. The lock is released on every
    /// exit path and `f`'s result is returned unchanged.
    pub fn with_lock<T, E, F>(&self, domain: LockDomain, cancel: &CancelToken, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<EnvError>,
    {
        let _guard = self.lock(domain, cancel)?;
        f()
    }

    /// Run `f` while holding `domain` shared.
    pub fn with_rlock<T, E, F>(
        &self,
        domain: LockDomain,
        cancel: &CancelToken,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<EnvError>,
    {
        let _guard = self.rlock(domain, cancel)?;
        f()
    }

    #[instrument(skip_all, fields(repo = %self.repo.display(), domain = %domain, kind = ?kind))]
    fn acquire(
        &self,
        domain: LockDomain,
        kind: LockKind,
        cancel: &CancelToken,
    ) -> EnvResult<RepositoryLockGuard> {
        fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("create lock directory {}", self.lock_dir.display()))?;
        let path = self.lock_path(domain);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        loop {
            let attempt = match kind {
                LockKind::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
                LockKind::Shared => fs2::FileExt::try_lock_shared(&file),
            };
            match attempt {
                Ok(()) => {
                    debug!("lock acquired");
                    return Ok(RepositoryLockGuard { file, path, domain });
                }
                Err(err) if is_contended(&err) => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("lock {}", path.display()))
                        .into());
                }
            }
            if cancel.is_done() {
                warn!("lock acquisition timed out");
                return Err(EnvError::LockTimeout {
                    domain,
                    repo: self.repo.clone(),
                });
            }
            cancel.sleep(self.poll_interval);
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held repository lock; released on drop.
#[derive(Debug)]
pub struct RepositoryLockGuard {
    file: File,
    path: PathBuf,
    domain: LockDomain,
}

impl RepositoryLockGuard {
    pub fn domain(&self) -> LockDomain {
        self.domain
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepositoryLockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
