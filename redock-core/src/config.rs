//! Deployment configuration.
//!
//! # Storage
//!
//! One YAML document, by default at `~/.redock/config.yaml`:
//!
//! ```yaml
//! worktree: /srv/app
//! remote: origin
//! branch: main
//! strategy: discard        # or: preserve
//! manifest: docker-compose.yml
//! env_file: .env
//! ```
//!
//! # API pattern
//!
//! Every function that touches the default location has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Explicit paths (`--config`) go through [`load_from`] / [`save_to`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;
use crate::types::Strategy;

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Bounded retry for transient remote failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            backoff: Backoff::Exponential,
        }
    }
}

/// Everything the reconciliation pipeline needs to know about one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Absolute path of the git checkout the stack is built from.
    pub worktree: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub strategy: Strategy,
    /// Compose manifest, relative to `worktree` unless absolute.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Runtime environment file, relative to `worktree` unless absolute.
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
    /// Program and leading arguments of the compose primitive.
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub prune_images: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_remote() -> String {
    "origin".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_manifest() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}
fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}
fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}
fn default_fetch_timeout_secs() -> u64 {
    120
}
fn default_build_timeout_secs() -> u64 {
    30 * 60
}
fn default_true() -> bool {
    true
}

impl DeployConfig {
    /// A config with every optional field at its default.
    pub fn new(worktree: impl Into<PathBuf>) -> Self {
        Self {
            worktree: worktree.into(),
            remote: default_remote(),
            branch: default_branch(),
            strategy: Strategy::default(),
            manifest: default_manifest(),
            env_file: default_env_file(),
            compose_command: default_compose_command(),
            project_name: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            prune_images: true,
            retry: RetryConfig::default(),
        }
    }

    /// Manifest path resolved against the working tree.
    pub fn manifest_path(&self) -> PathBuf {
        self.worktree.join(&self.manifest)
    }

    /// Environment file path resolved against the working tree.
    pub fn env_file_path(&self) -> PathBuf {
        self.worktree.join(&self.env_file)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Reject values that would only fail later, mid-reconciliation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.worktree.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "worktree",
                reason: format!("must be absolute, got '{}'", self.worktree.display()),
            });
        }
        if self.remote.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote",
                reason: "must not be empty".to_string(),
            });
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "branch",
                reason: "must not be empty".to_string(),
            });
        }
        if self.compose_command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "compose_command",
                reason: "must name a program".to_string(),
            });
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate the config at an explicit path. The worktree comes
/// back with `.`, `..` and trailing separators resolved.
///
/// Returns `ConfigError::NotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_from(path: &Path) -> Result<DeployConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let mut config: DeployConfig = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    config.worktree = paths::normalize(&config.worktree);
    Ok(config)
}

/// Load `<home>/.redock/config.yaml`.
pub fn load_at(home: &Path) -> Result<DeployConfig, ConfigError> {
    load_from(&paths::config_path(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<DeployConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to an explicit path.
///
/// Write flow: validate → serialize → `.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_to(path: &Path, config: &DeployConfig) -> Result<(), ConfigError> {
    config.validate()?;
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            set_dir_permissions(dir)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| paths::CONFIG_FILE.to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Save to `<home>/.redock/config.yaml`.
pub fn save_at(home: &Path, config: &DeployConfig) -> Result<PathBuf, ConfigError> {
    let path = paths::config_path(home);
    save_to(&path, config)?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &DeployConfig) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
