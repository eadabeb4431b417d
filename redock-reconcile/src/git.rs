//! Source repository seam and its `git` CLI implementation.
//!
//! The reconciler only ever needs a handful of repository operations; they
//! are collected in [`SourceRepository`] so the synchronizer can be driven by
//! the real `git` binary in production and in integration tests alike.

use std::path::{Component, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use redock_core::types::{CommitRef, StashRef};

use crate::error::tail_lines;
use crate::runner::{CommandError, CommandRunner, CommandSpec, SystemRunner};

/// Identity used for stash commits; deploy hosts rarely configure one.
const STASH_IDENTITY: [&str; 4] = ["-c", "user.name=redock", "-c", "user.email=redock@localhost"];

/// stderr fragments git prints when the remote cannot be reached.
const NETWORK_MARKERS: &[&str] = &[
    "could not resolve host",
    "could not read from remote repository",
    "unable to access",
    "connection refused",
    "connection timed out",
    "connection reset",
    "operation timed out",
    "network is unreachable",
    "the remote end hung up",
    "early eof",
    "ssh: connect to host",
    "temporary failure in name resolution",
];

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`git {args}` exited with {code}: {stderr}")]
    Failed {
        args: String,
        code: String,
        stderr: String,
    },
}

impl GitError {
    /// Transient network condition: worth retrying with backoff.
    pub fn is_network(&self) -> bool {
        match self {
            GitError::Command(CommandError::TimedOut { .. }) => true,
            GitError::Command(_) => false,
            GitError::Failed { stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                NETWORK_MARKERS.iter().any(|m| lower.contains(m))
            }
        }
    }

    /// The diagnostic part of the error, without the command line.
    pub fn detail(&self) -> String {
        match self {
            GitError::Failed { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}

/// Repository operations used by the synchronizer.
///
/// `keep` lists tree-relative paths that must survive every destructive
/// operation (the runtime environment file lives inside the tree and is
/// usually untracked).
pub trait SourceRepository: Send + Sync {
    /// Whether a repository exists at the working-tree path.
    fn exists(&self) -> bool;

    /// Current `HEAD`, or `None` on an unborn branch.
    fn head(&self) -> Result<Option<CommitRef>, GitError>;

    /// Update the remote-tracking ref and return the remote tip.
    fn fetch(&self, remote: &str, branch: &str) -> Result<CommitRef, GitError>;

    /// Tracked modifications or untracked, non-ignored files.
    fn has_local_changes(&self, keep: &[PathBuf]) -> Result<bool, GitError>;

    /// Reset tracked files to `HEAD` and delete untracked, non-ignored files.
    fn discard_local_changes(&self, keep: &[PathBuf]) -> Result<(), GitError>;

    /// Point `branch` at `commit` and check it out.
    fn checkout(&self, branch: &str, commit: &CommitRef) -> Result<(), GitError>;

    /// Set local modifications aside. `None` when there was nothing to save.
    fn stash(&self, message: &str, keep: &[PathBuf]) -> Result<Option<StashRef>, GitError>;

    /// Reapply a stash entry without removing it.
    fn unstash(&self, stash: &StashRef) -> Result<(), GitError>;

    /// Remove a stash entry that has been reapplied.
    fn drop_stash(&self, stash: &StashRef) -> Result<(), GitError>;
}

/// [`SourceRepository`] backed by the `git` executable.
#[derive(Clone)]
pub struct GitCli {
    worktree: PathBuf,
    runner: Arc<dyn CommandRunner>,
    fetch_timeout: Duration,
}

impl GitCli {
    pub fn new(worktree: impl Into<PathBuf>, fetch_timeout: Duration) -> Self {
        Self::with_runner(worktree, fetch_timeout, Arc::new(SystemRunner))
    }

    pub fn with_runner(
        worktree: impl Into<PathBuf>,
        fetch_timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            worktree: worktree.into(),
            runner,
            fetch_timeout,
        }
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("git")
            .args(args)
            .current_dir(&self.worktree)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
    }

    /// Run and require a zero exit; returns trimmed stdout.
    fn git(&self, spec: CommandSpec) -> Result<String, GitError> {
        let output = self.runner.run(&spec)?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(GitError::Failed {
                args: spec.args.join(" "),
                code: output.code_label(),
                stderr: tail_lines(&output.stderr, 6),
            })
        }
    }

    /// `rev-parse --verify -q`, mapping exit 1 to `None`.
    fn resolve(&self, rev: &str) -> Result<Option<CommitRef>, GitError> {
        let spec = self.spec(["rev-parse", "--verify", "-q", rev]);
        let output = self.runner.run(&spec)?;
        match output.code {
            Some(0) => Ok(Some(CommitRef::from(output.stdout.trim()))),
            Some(1) => Ok(None),
            _ => Err(GitError::Failed {
                args: spec.args.join(" "),
                code: output.code_label(),
                stderr: tail_lines(&output.stderr, 6),
            }),
        }
    }
}

/// `-- . :(exclude)<path>…` pathspec limiting a command to everything but
/// the kept paths. Paths git would reject as outside the tree are skipped.
fn exclude_pathspec(keep: &[PathBuf]) -> Vec<String> {
    let mut args = vec!["--".to_string(), ".".to_string()];
    let inside = |path: &&PathBuf| {
        path.is_relative() && !path.components().any(|c| c == Component::ParentDir)
    };
    for path in keep.iter().filter(inside) {
        args.push(format!(":(exclude){}", path.display()));
    }
    args
}

impl SourceRepository for GitCli {
    fn exists(&self) -> bool {
        self.worktree.join(".git").exists()
    }

    fn head(&self) -> Result<Option<CommitRef>, GitError> {
        self.resolve("HEAD^{commit}")
    }

    fn fetch(&self, remote: &str, branch: &str) -> Result<CommitRef, GitError> {
        let tracking = format!("refs/remotes/{remote}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking}");
        self.git(
            self.spec(["fetch", "--quiet", "--no-tags", remote, refspec.as_str()])
                .timeout(self.fetch_timeout),
        )?;
        let tip = self.git(self.spec(["rev-parse", "--verify", &format!("{tracking}^{{commit}}")]))?;
        Ok(CommitRef::from(tip))
    }

    fn has_local_changes(&self, keep: &[PathBuf]) -> Result<bool, GitError> {
        let mut args = vec![
            "status".to_string(),
            "--porcelain".to_string(),
            "--untracked-files=all".to_string(),
        ];
        args.extend(exclude_pathspec(keep));
        let status = self.git(self.spec(args))?;
        Ok(!status.is_empty())
    }

    fn discard_local_changes(&self, keep: &[PathBuf]) -> Result<(), GitError> {
        if self.head()?.is_some() {
            self.git(self.spec(["reset", "--hard", "--quiet", "HEAD"]))?;
        }
        let mut args = vec!["clean".to_string(), "-fd".to_string(), "--quiet".to_string()];
        for path in keep {
            args.push("-e".to_string());
            args.push(format!("/{}", path.display()));
        }
        self.git(self.spec(args))?;
        Ok(())
    }

    fn checkout(&self, branch: &str, commit: &CommitRef) -> Result<(), GitError> {
        self.git(self.spec(["checkout", "--quiet", "--force", "-B", branch, commit.0.as_str()]))?;
        Ok(())
    }

    fn stash(&self, message: &str, keep: &[PathBuf]) -> Result<Option<StashRef>, GitError> {
        let before = self.resolve("refs/stash")?;
        let mut args: Vec<String> = STASH_IDENTITY.iter().map(|s| s.to_string()).collect();
        args.extend(
            ["stash", "push", "--include-untracked", "--message", message]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(exclude_pathspec(keep));
        self.git(self.spec(args))?;

        let after = self.resolve("refs/stash")?;
        if after.is_none() || after == before {
            return Ok(None);
        }
        Ok(after.map(|c| StashRef(c.0)))
    }

    fn unstash(&self, stash: &StashRef) -> Result<(), GitError> {
        let mut args: Vec<String> = STASH_IDENTITY.iter().map(|s| s.to_string()).collect();
        args.extend(["stash", "apply", "--quiet", stash.0.as_str()].iter().map(|s| s.to_string()));
        self.git(self.spec(args))?;
        Ok(())
    }

    fn drop_stash(&self, stash: &StashRef) -> Result<(), GitError> {
        // `stash drop` only takes reflog selectors, so find the entry's index.
        let listing = self.git(self.spec(["stash", "list", "--format=%H"]))?;
        let Some(index) = listing.lines().position(|line| line.trim() == stash.0) else {
            return Ok(());
        };
        let selector = format!("stash@{{{index}}}");
        self.git(self.spec(["stash", "drop", "--quiet", selector.as_str()]))?;
        Ok(())
    }
}
