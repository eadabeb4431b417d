pub mod daemon;
pub mod init;
pub mod reconcile;
pub mod status;
pub mod trigger;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use redock_core::{config, paths, DeployConfig};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// `--config` if given, else `~/.redock/config.yaml`.
pub(crate) fn config_path(explicit: Option<&Path>, home: &Path) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths::config_path(home))
}

pub(crate) fn load_config(explicit: Option<&Path>, home: &Path) -> Result<DeployConfig> {
    let path = config_path(explicit, home);
    config::load_from(&path).with_context(|| format!("failed to load config {}", path.display()))
}
