//! Service lifecycle: OS registration adapters, the lifecycle controller and
//! the long-running daemon.
//!
//! The controller only talks to a [`ServiceManager`]; the systemd adapter is
//! one implementation and the scheduler never sees either.

mod controller;
pub mod daemon;
mod status;
mod systemd;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use controller::ServiceController;
pub use status::{ServiceState, ServiceStatus, StatusFile, HEARTBEAT_INTERVAL, STALE_AFTER};
pub use systemd::SystemdUserManager;

pub const SERVICE_NAME: &str = "offline-mode";

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Lifecycle operation attempted during an active cycle without prior stop
    #[error("Service is running a sync cycle; run `stop` first")]
    Busy,

    #[error("Service is not installed; run `install` first")]
    NotInstalled,

    #[error("Service management is not supported here: {0}")]
    Unsupported(String),

    /// The OS service manager reported a failure
    #[error("Service manager command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the OS service manager needs to launch the daemon.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub executable: PathBuf,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    /// Upper bound the manager waits on stop before killing the process.
    pub stop_timeout_secs: u64,
}

/// Registers and controls the daemon with the host's service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    fn is_installed(&self) -> bool;

    async fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceError>;

    async fn start(&self) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    async fn uninstall(&self) -> Result<(), ServiceError>;
}

/// Platforms without a supported service manager.
pub struct UnsupportedManager {
    reason: String,
}

impl UnsupportedManager {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err(&self) -> ServiceError {
        ServiceError::Unsupported(self.reason.clone())
    }
}

#[async_trait]
impl ServiceManager for UnsupportedManager {
    fn is_installed(&self) -> bool {
        false
    }

    async fn install(&self, _spec: &ServiceSpec) -> Result<(), ServiceError> {
        Err(self.err())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        Err(self.err())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        Err(self.err())
    }

    async fn uninstall(&self) -> Result<(), ServiceError> {
        Err(self.err())
    }
}

/// The service manager for this host.
pub fn platform_manager() -> Box<dyn ServiceManager> {
    if cfg!(target_os = "linux") {
        match SystemdUserManager::for_current_user() {
            Some(manager) => Box::new(manager),
            None => Box::new(UnsupportedManager::new(
                "cannot locate the systemd user unit directory",
            )),
        }
    } else {
        Box::new(UnsupportedManager::new(format!(
            "no service manager adapter for {}; use `debug` to run in the foreground",
            std::env::consts::OS
        )))
    }
}
