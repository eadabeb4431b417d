//! Per-working-tree exclusive lock.
//!
//! An advisory `flock` on `~/.redock/locks/<digest>.lock`, where the digest
//! is taken over the tree's canonical path, so every spelling of one
//! checkout (trailing slash, `..`, symlink) maps to the same lock. Held for a whole reconciliation so CLI
//! one-shots and the daemon never interleave on the same checkout.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use redock_core::paths;
use sha2::{Digest, Sha256};

use crate::error::ReconcileError;

/// Held lock; released on drop.
#[derive(Debug)]
pub struct WorktreeLock {
    file: File,
    path: PathBuf,
}

/// Lock file path for `worktree` under `locks_dir`.
pub fn lock_path(locks_dir: &Path, worktree: &Path) -> PathBuf {
    let identity = paths::tree_identity(worktree);
    let digest = Sha256::digest(identity.as_os_str().to_string_lossy().as_bytes());
    locks_dir.join(format!("{}.lock", &hex::encode(digest)[..16]))
}

impl WorktreeLock {
    /// Block until the lock for `worktree` is ours.
    pub fn acquire(locks_dir: &Path, worktree: &Path) -> Result<Self, ReconcileError> {
        let (file, path) = open(locks_dir, worktree)?;
        if file.try_lock_exclusive().is_err() {
            tracing::info!(lock = %path.display(), "working tree busy, waiting for lock");
            file.lock_exclusive().map_err(|source| ReconcileError::Lock {
                path: path.clone(),
                source,
            })?;
        }
        Self::stamp(file, path, worktree)
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(locks_dir: &Path, worktree: &Path) -> Result<Option<Self>, ReconcileError> {
        let (file, path) = open(locks_dir, worktree)?;
        match file.try_lock_exclusive() {
            Ok(()) => Self::stamp(file, path, worktree).map(Some),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(ReconcileError::Lock { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the holder for whoever inspects a stuck lock.
    fn stamp(mut file: File, path: PathBuf, worktree: &Path) -> Result<Self, ReconcileError> {
        let holder = format!("{} {}\n", std::process::id(), worktree.display());
        file.set_len(0)
            .and_then(|_| file.write_all(holder.as_bytes()))
            .map_err(|source| ReconcileError::Lock {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }
}

impl Drop for WorktreeLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

fn open(locks_dir: &Path, worktree: &Path) -> Result<(File, PathBuf), ReconcileError> {
    let path = lock_path(locks_dir, worktree);
    std::fs::create_dir_all(locks_dir).map_err(|source| ReconcileError::Lock {
        path: locks_dir.to_path_buf(),
        source,
    })?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| ReconcileError::Lock {
            path: path.clone(),
            source,
        })?;
    Ok((file, path))
}
