//! `redock init --worktree <path> [--branch ...] [--strategy ...]`

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;

use redock_core::{config, paths, DeployConfig};

use super::super::StrategyArg;

/// Write the deployment config.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Git checkout the stack is built from.
    #[arg(long, short = 'w')]
    pub worktree: PathBuf,

    /// Remote to fetch from.
    #[arg(long, default_value = "origin")]
    pub remote: String,

    /// Branch whose tip is deployed.
    #[arg(long, short = 'b', default_value = "main")]
    pub branch: String,

    /// How local drift is resolved: discard | preserve.
    #[arg(long, short = 's', value_name = "STRATEGY", default_value = "discard")]
    pub strategy: StrategyArg,

    /// Compose manifest, relative to the worktree.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Runtime environment file, relative to the worktree.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Compose project name (`-p`).
    #[arg(long)]
    pub project_name: Option<String>,

    /// Skip image pruning after a successful build.
    #[arg(long)]
    pub no_prune: bool,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self, config_override: Option<&Path>) -> Result<()> {
        let home = super::home()?;
        let path = super::config_path(config_override, &home);
        if path.exists() && !self.force {
            bail!(
                "config already exists at {}; pass --force to overwrite",
                path.display()
            );
        }

        let worktree = absolute(&self.worktree)?;
        let mut cfg = DeployConfig::new(worktree);
        cfg.remote = self.remote;
        cfg.branch = self.branch;
        cfg.strategy = self.strategy.into();
        if let Some(manifest) = self.manifest {
            cfg.manifest = manifest;
        }
        if let Some(env_file) = self.env_file {
            cfg.env_file = env_file;
        }
        cfg.project_name = self.project_name;
        cfg.prune_images = !self.no_prune;

        config::save_to(&path, &cfg)
            .with_context(|| format!("failed to write config {}", path.display()))?;

        println!("✓ Deploying '{}' from {}/{}", cfg.worktree.display(), cfg.remote, cfg.branch);
        println!("  strategy: {}", cfg.strategy);
        println!("  Saved to: {}", path.display());
        if !cfg.worktree.join(".git").exists() {
            println!("  note: {} is not a git checkout yet", cfg.worktree.display());
        }
        Ok(())
    }
}

/// Canonical path if it exists, otherwise joined onto the current directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        return Ok(paths::normalize(path));
    }
    let cwd = std::env::current_dir().context("cannot resolve current directory")?;
    Ok(paths::normalize(&cwd.join(path)))
}
