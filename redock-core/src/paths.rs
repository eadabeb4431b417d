//! Filesystem layout under `~/.redock/`.
//!
//! ```text
//! ~/.redock/
//!   config.yaml          deployment config (mode 0600)
//!   daemon.sock          daemon control socket (mode 0600)
//!   state/last_run.json  last reconciliation record
//!   locks/<digest>.lock  one per working tree
//! ```

use std::path::{Component, Path, PathBuf};

pub const CONFIG_FILE: &str = "config.yaml";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const LAST_RUN_FILE: &str = "last_run.json";

pub fn redock_root(home: &Path) -> PathBuf {
    home.join(".redock")
}

pub fn config_path(home: &Path) -> PathBuf {
    redock_root(home).join(CONFIG_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    redock_root(home).join(DAEMON_SOCKET)
}

pub fn state_dir(home: &Path) -> PathBuf {
    redock_root(home).join("state")
}

pub fn last_run_path(home: &Path) -> PathBuf {
    state_dir(home).join(LAST_RUN_FILE)
}

pub fn locks_dir(home: &Path) -> PathBuf {
    redock_root(home).join("locks")
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// `..` never climbs above the root of an absolute path; leading `..` of a
/// relative path are kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Identity of a working tree on this host: the canonical path when the
/// tree exists, the normalized path when it does not.
pub fn tree_identity(worktree: &Path) -> PathBuf {
    std::fs::canonicalize(worktree).unwrap_or_else(|_| normalize(worktree))
}
