//! Real git fixtures: a bare remote, a seed clone that publishes commits,
//! and a deploy checkout the synchronizer works on.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use redock_core::types::CommitRef;
use redock_reconcile::driver::{ContainerRuntime, DeploymentDescriptor};
use redock_reconcile::{BuildError, PruneError};
use tempfile::TempDir;

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.name", "test"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

pub struct Fixture {
    pub root: TempDir,
    pub home: TempDir,
    pub remote: PathBuf,
    pub seed: PathBuf,
    pub deploy: PathBuf,
}

impl Fixture {
    /// Remote with one commit on `main`, cloned into `deploy`.
    pub fn new() -> Self {
        let root = TempDir::new().expect("root");
        let home = TempDir::new().expect("home");
        let remote = root.path().join("remote.git");
        let seed = root.path().join("seed");
        let deploy = root.path().join("deploy");

        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "--bare", "--quiet"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "--quiet"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        configure_identity(&seed);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);

        let fixture = Self {
            root,
            home,
            remote,
            seed,
            deploy,
        };
        fixture.publish(&[
            ("docker-compose.yml", "services:\n  app:\n    build: .\n"),
            ("app.txt", "version = 1\n"),
            ("notes.txt", "ops notes\n"),
            (".gitignore", "cache/\n"),
        ]);

        git(
            fixture.root.path(),
            &[
                "clone",
                "--quiet",
                "-b",
                "main",
                fixture.remote.to_str().unwrap(),
                "deploy",
            ],
        );
        configure_identity(&fixture.deploy);
        fixture
    }

    /// Commit `files` in the seed clone and push them to the remote.
    pub fn publish(&self, files: &[(&str, &str)]) -> CommitRef {
        for (name, contents) in files {
            std::fs::write(self.seed.join(name), contents).unwrap();
        }
        git(&self.seed, &["add", "-A"]);
        git(&self.seed, &["commit", "--quiet", "-m", "publish"]);
        git(&self.seed, &["push", "--quiet", "origin", "main"]);
        CommitRef::from(git(&self.seed, &["rev-parse", "HEAD"]))
    }

    pub fn deploy_head(&self) -> CommitRef {
        CommitRef::from(git(&self.deploy, &["rev-parse", "HEAD"]))
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.deploy.join(name)).unwrap()
    }

    pub fn write(&self, name: &str, contents: &str) {
        let path = self.deploy.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn status(&self) -> String {
        git(&self.deploy, &["status", "--porcelain", "--untracked-files=all"])
    }

    pub fn stash_list(&self) -> Vec<String> {
        git(&self.deploy, &["stash", "list", "--format=%H"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Records build and prune calls instead of talking to a container engine.
#[derive(Clone, Default)]
pub struct RecordingRuntime {
    pub builds: Arc<Mutex<Vec<DeploymentDescriptor>>>,
    pub prunes: Arc<AtomicUsize>,
}

impl RecordingRuntime {
    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

impl ContainerRuntime for RecordingRuntime {
    fn build_and_run(&self, descriptor: &DeploymentDescriptor) -> Result<(), BuildError> {
        assert!(
            descriptor.env_file.is_file(),
            "env file must exist before the build runs"
        );
        self.builds.lock().unwrap().push(descriptor.clone());
        Ok(())
    }

    fn prune_unused_images(&self) -> Result<usize, PruneError> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}
