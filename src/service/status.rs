//! `service.json`: the running service's heartbeat and state, shared with
//! the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SchedulerState;

/// Interval at which the service rewrites its status.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A status older than this is treated as a dead service.
pub const STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Idle,
    Running,
    Stopping,
}

impl From<SchedulerState> for ServiceState {
    fn from(state: SchedulerState) -> Self {
        match state {
            SchedulerState::Idle => ServiceState::Idle,
            SchedulerState::Running => ServiceState::Running,
            SchedulerState::Stopping => ServiceState::Stopping,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServiceState::Idle => "idle",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub pid: u32,
    pub state: ServiceState,
    /// Mirrors the stop marker next to the status file; never serialized.
    #[serde(skip)]
    pub stop_requested: bool,
    pub updated_at: DateTime<Utc>,
}

impl ServiceStatus {
    /// True when the heartbeat is recent enough to trust.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match (now - self.updated_at).to_std() {
            Ok(age) => age <= STALE_AFTER,
            // Timestamp in the future: clock skew, still fresh
            Err(_) => true,
        }
    }

    /// Running a cycle with nobody having asked it to stop.
    pub fn is_busy(&self, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.state == ServiceState::Running && !self.stop_requested
    }
}

/// Handle on the status file and its stop marker.
///
/// The service owns the status file and rewrites it on every heartbeat. A
/// stop request goes to a separate marker holding the target pid, so the
/// CLI never races the heartbeat for the same file.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
    stop_marker: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stop_marker = path.with_extension("stop");
        Self { path, stop_marker }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid named by a pending stop request, if any.
    fn stop_target(&self) -> Option<u32> {
        std::fs::read_to_string(&self.stop_marker)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Read the status. A missing or unreadable file means no status.
    pub fn read(&self) -> Option<ServiceStatus> {
        let mut status = self.read_status()?;
        status.stop_requested = self.stop_target() == Some(status.pid);
        Some(status)
    }

    fn read_status(&self) -> Option<ServiceStatus> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read service status");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring malformed service status");
                None
            }
        }
    }

    /// Replace the file atomically (temp file, fsync, rename).
    pub fn write(&self, status: &ServiceStatus) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(status).map_err(io::Error::from)?;
        let tmp = self.path.with_extension(format!("json.tmp.{}", std::process::id()));

        let result = (|| {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            drop(file);
            #[cfg(windows)]
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            std::fs::rename(&tmp, &self.path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Publish `state` for process `pid`. A pending stop request for the
    /// same pid is reported back and left in place.
    pub fn publish(&self, pid: u32, state: ServiceState, now: DateTime<Utc>) -> io::Result<ServiceStatus> {
        let mut status = ServiceStatus {
            pid,
            state,
            stop_requested: false,
            updated_at: now,
        };
        self.write(&status)?;
        status.stop_requested = self.stop_target() == Some(pid);
        Ok(status)
    }

    /// Ask the process named in the current status to stop. Returns false
    /// when there is no status to flag.
    pub fn request_stop(&self) -> io::Result<bool> {
        match self.read_status() {
            Some(status) => {
                std::fs::write(&self.stop_marker, status.pid.to_string())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the status and any stop request.
    pub fn clear(&self) -> io::Result<()> {
        remove_if_present(&self.stop_marker)?;
        remove_if_present(&self.path)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
