//! Well-known file locations.
//!
//! Data lives under `dirs::data_dir()/offline-mode` and configuration under
//! `dirs::config_dir()/offline-mode`. Both can be redirected with an
//! environment variable, which tests and the service unit use.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "offline-mode";

pub const DATA_DIR_ENV: &str = "OFFLINE_MODE_DATA_DIR";
pub const CONFIG_DIR_ENV: &str = "OFFLINE_MODE_CONFIG_DIR";

fn resolve(env_var: &str, base: Option<PathBuf>, kind: &str) -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(env_var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    base.map(|b| b.join(APP_DIR))
        .with_context(|| format!("Cannot determine the {kind} directory; set {env_var}"))
}

pub fn data_dir() -> Result<PathBuf> {
    resolve(DATA_DIR_ENV, dirs::data_dir(), "data")
}

pub fn config_dir() -> Result<PathBuf> {
    resolve(CONFIG_DIR_ENV, dirs::config_dir(), "config")
}

/// Resolved set of files used by the CLI and the service.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl AppPaths {
    pub fn resolve() -> Result<Self> {
        Ok(Self {
            data_dir: data_dir()?,
            config_dir: config_dir()?,
        })
    }

    /// Paths rooted at explicit directories.
    pub fn at(data_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("service.json")
    }

    pub fn trigger_file(&self) -> PathBuf {
        self.data_dir.join("sync-now.request")
    }

    /// Create the data and config directories, user-only on Unix.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.config_dir, &self.log_dir()] {
            create_private_dir(dir)?;
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to restrict directory permissions");
        }
    }
    Ok(())
}
