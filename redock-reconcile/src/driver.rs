//! Build-and-run driver and the container runtime seam.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use redock_core::types::{CommitRef, StackIdentity};
use redock_core::DeployConfig;

use crate::error::{tail_lines, BuildError, PruneError, ReconcileError};
use crate::runner::{CommandRunner, CommandSpec, SystemRunner};

/// Length of the descriptor digest in a [`StackIdentity`].
const DIGEST_LEN: usize = 12;

/// Inputs the compose primitive materializes a stack from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    pub project_dir: PathBuf,
    pub manifest: PathBuf,
    pub env_file: PathBuf,
    pub project_name: Option<String>,
    pub compose_command: Vec<String>,
    pub build_timeout: Duration,
}

impl DeploymentDescriptor {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            project_dir: config.worktree.clone(),
            manifest: config.manifest_path(),
            env_file: config.env_file_path(),
            project_name: config.project_name.clone(),
            compose_command: config.compose_command.clone(),
            build_timeout: config.build_timeout(),
        }
    }

    /// Full `up` invocation for this descriptor.
    pub fn up_command(&self) -> CommandSpec {
        let (program, leading) = match self.compose_command.split_first() {
            Some((program, rest)) => (program.as_str(), rest),
            None => ("docker", &[][..]),
        };
        let mut spec = CommandSpec::new(program)
            .args(leading.iter().cloned())
            .arg("-f")
            .arg(self.manifest.to_string_lossy())
            .arg("--env-file")
            .arg(self.env_file.to_string_lossy());
        if let Some(name) = &self.project_name {
            spec = spec.arg("-p").arg(name.as_str());
        }
        spec.args(["up", "-d", "--build", "--remove-orphans"])
            .current_dir(&self.project_dir)
            .timeout(self.build_timeout)
    }
}

/// Container orchestration primitive.
pub trait ContainerRuntime: Send + Sync {
    /// Build images and (re)start the stack detached.
    fn build_and_run(&self, descriptor: &DeploymentDescriptor) -> Result<(), BuildError>;

    /// Remove dangling images; returns how many were deleted.
    fn prune_unused_images(&self) -> Result<usize, PruneError>;
}

/// [`ContainerRuntime`] driving `docker compose` and `docker image prune`.
#[derive(Clone)]
pub struct ComposeRuntime {
    runner: Arc<dyn CommandRunner>,
    docker: String,
}

impl ComposeRuntime {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            docker: "docker".to_string(),
        }
    }
}

impl Default for ComposeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for ComposeRuntime {
    fn build_and_run(&self, descriptor: &DeploymentDescriptor) -> Result<(), BuildError> {
        let spec = descriptor.up_command();
        tracing::info!(command = %spec, "building and starting stack");
        let output = self.runner.run(&spec)?;
        if output.success() {
            Ok(())
        } else {
            Err(BuildError::Exited {
                command: spec.to_string(),
                code: output.code_label(),
                stderr: tail_lines(&output.stderr, 12),
            })
        }
    }

    fn prune_unused_images(&self) -> Result<usize, PruneError> {
        // Without `--all` only dangling images go; anything a container
        // references is left alone by the daemon.
        let spec = CommandSpec::new(self.docker.as_str()).args(["image", "prune", "--force"]);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(PruneError::Exited {
                command: spec.to_string(),
                code: output.code_label(),
                stderr: tail_lines(&output.stderr, 6),
            });
        }
        Ok(count_deleted(&output.stdout))
    }
}

/// Count `Deleted: sha256:…` lines in `docker image prune` output.
fn count_deleted(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|line| line.trim_start().to_ascii_lowercase().starts_with("deleted:"))
        .count()
}

/// Make sure the environment file exists as a regular file, creating an
/// empty one (and its parent directory) when absent.
pub fn ensure_env_file(path: &Path) -> Result<(), ReconcileError> {
    let missing = |source| ReconcileError::ConfigMissing {
        path: path.to_path_buf(),
        source,
    };
    if path.is_dir() {
        return Err(missing(std::io::Error::new(
            std::io::ErrorKind::Other,
            "a directory occupies the path",
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(missing)?;
    }
    let existed = path.exists();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(missing)?;
    if !existed {
        tracing::warn!(env_file = %path.display(), "environment file was missing, created empty");
    }
    Ok(())
}

/// Identity of the stack the descriptor produces at `commit`.
///
/// An unreadable descriptor file contributes no bytes.
pub fn stack_identity(commit: &CommitRef, descriptor: &DeploymentDescriptor) -> StackIdentity {
    let mut hasher = Sha256::new();
    hasher.update(std::fs::read(&descriptor.manifest).unwrap_or_default());
    hasher.update([0u8]);
    hasher.update(std::fs::read(&descriptor.env_file).unwrap_or_default());
    let digest = hex::encode(hasher.finalize());
    StackIdentity {
        commit: commit.clone(),
        descriptor_digest: digest[..DIGEST_LEN].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::runner::{CommandError, CommandOutput};

    struct ScriptedRunner {
        output: CommandOutput,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                output: CommandOutput {
                    code: Some(code),
                    stdout: stdout.into(),
                    stderr: stderr.into(),
                },
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.seen.lock().unwrap().push(spec.clone());
            Ok(self.output.clone())
        }
    }

    fn descriptor(dir: &Path) -> DeploymentDescriptor {
        let mut config = DeployConfig::new(dir);
        config.project_name = Some("codebot".into());
        DeploymentDescriptor::from_config(&config)
    }

    #[test]
    fn up_command_is_detached_build() {
        let spec = descriptor(Path::new("/srv/app")).up_command();
        assert_eq!(
            spec.to_string(),
            "docker compose -f /srv/app/docker-compose.yml --env-file /srv/app/.env -p codebot up -d --build --remove-orphans"
        );
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/srv/app")));
        assert!(spec.timeout.is_some());
    }

    #[test]
    fn build_failure_propagates_exit_status() {
        let runner = ScriptedRunner::new(17, "", "step 1\nfailed to solve: no such file\n");
        let runtime = ComposeRuntime::with_runner(runner.clone());
        let err = runtime.build_and_run(&descriptor(Path::new("/srv/app"))).unwrap_err();
        match err {
            BuildError::Exited { code, stderr, .. } => {
                assert_eq!(code, "17");
                assert!(stderr.contains("failed to solve"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn prune_counts_deleted_images() {
        let stdout = "Deleted Images:\ndeleted: sha256:aaa\ndeleted: sha256:bbb\nuntagged: app:old\n\nTotal reclaimed space: 1.2GB\n";
        let runner = ScriptedRunner::new(0, stdout, "");
        let runtime = ComposeRuntime::with_runner(runner.clone());
        assert_eq!(runtime.prune_unused_images().unwrap(), 2);
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].to_string(), "docker image prune --force");
    }

    #[test]
    fn ensure_env_file_creates_empty_regular_file() {
        let dir = TempDir::new().expect("tempdir");
        let env = dir.path().join("deploy").join(".env");
        ensure_env_file(&env).expect("create");
        let meta = std::fs::metadata(&env).expect("metadata");
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn ensure_env_file_keeps_existing_contents() {
        let dir = TempDir::new().expect("tempdir");
        let env = dir.path().join(".env");
        std::fs::write(&env, "TOKEN=abc\n").unwrap();
        ensure_env_file(&env).expect("ensure");
        assert_eq!(std::fs::read_to_string(&env).unwrap(), "TOKEN=abc\n");
    }

    #[test]
    fn ensure_env_file_rejects_directory() {
        let dir = TempDir::new().expect("tempdir");
        let env = dir.path().join(".env");
        std::fs::create_dir(&env).unwrap();
        let err = ensure_env_file(&env).unwrap_err();
        assert!(matches!(err, ReconcileError::ConfigMissing { .. }), "got {err}");
    }

    #[test]
    fn identity_tracks_descriptor_contents() {
        let dir = TempDir::new().expect("tempdir");
        let desc = descriptor(dir.path());
        std::fs::write(&desc.manifest, "services: {}\n").unwrap();
        std::fs::write(&desc.env_file, "A=1\n").unwrap();
        let commit = CommitRef::from("0123456789ab");

        let first = stack_identity(&commit, &desc);
        assert_eq!(first, stack_identity(&commit, &desc));
        assert_eq!(first.descriptor_digest.len(), DIGEST_LEN);

        std::fs::write(&desc.env_file, "A=2\n").unwrap();
        assert_ne!(first, stack_identity(&commit, &desc));
    }
}
