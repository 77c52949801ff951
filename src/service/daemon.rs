//! The long-running service process behind `run` and `debug`.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::{ServiceState, StatusFile, HEARTBEAT_INTERVAL};
use crate::config::Config;
use crate::paths::AppPaths;
use crate::storage::Database;
use crate::sync::{self, ConfiguredRunner, SchedulerState};

/// How often the trigger and status files are checked.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Ask a running daemon for an immediate cycle.
pub fn request_sync(paths: &AppPaths) -> std::io::Result<()> {
    std::fs::write(paths.trigger_file(), Utc::now().to_rfc3339())
}

/// Consume a pending manual trigger.
fn take_trigger(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to consume sync trigger");
            false
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn publish(status: &StatusFile, pid: u32, state: SchedulerState) {
    if let Err(e) = status.publish(pid, ServiceState::from(state), Utc::now()) {
        tracing::warn!(error = %e, "Failed to write service status");
    }
}

/// Run the scheduler until a signal or a stop request arrives, then wait
/// up to the configured grace period for the in-flight cycle.
pub async fn run(paths: &AppPaths) -> Result<()> {
    paths.ensure_dirs()?;

    let status = StatusFile::new(paths.status_file());
    let pid = std::process::id();
    if let Some(existing) = status.read() {
        if existing.pid != pid && existing.is_live(Utc::now()) {
            bail!(
                "Another instance (pid {}) is already running; stop it first",
                existing.pid
            );
        }
    }

    // Interval and grace are fixed for the life of the process
    let config = Config::load(&paths.config_file()).context("Failed to load configuration")?;
    let interval = config.sync_interval();
    let grace = config.shutdown_grace();

    let store = paths.store_file();
    let db = Database::open(&store.to_string_lossy())
        .await
        .with_context(|| format!("Failed to open state store '{}'", store.display()))?;

    let last = db
        .last_completed_cycle()
        .await
        .context("Failed to read cycle history")?
        .map(|record| record.finished_at);
    let first_delay = sync::initial_delay(Utc::now(), last, interval);

    // Triggers left from before this process started are stale
    take_trigger(&paths.trigger_file());

    let runner = Arc::new(ConfiguredRunner::new(paths.config_file(), db.clone()));
    let mut handle = sync::spawn(runner, interval, first_delay);
    let mut state = handle.subscribe();

    tracing::info!(pid, first_cycle_in_secs = first_delay.as_secs(), "Service started");
    publish(&status, pid, handle.state());

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("Shutdown signal received");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    tracing::error!("Scheduler exited unexpectedly");
                    break;
                }
                let current = *state.borrow_and_update();
                publish(&status, pid, current);
            }
            _ = heartbeat.tick() => {
                publish(&status, pid, handle.state());
            }
            _ = poll.tick() => {
                if status.read().is_some_and(|s| s.pid == pid && s.stop_requested) {
                    tracing::info!("Stop requested through status file");
                    break;
                }
                if take_trigger(&paths.trigger_file()) {
                    handle.sync_now();
                }
            }
        }
    }

    handle.stop();
    publish(&status, pid, SchedulerState::Stopping);

    let joined = tokio::time::timeout(grace, handle.join()).await;
    match joined {
        Ok(Ok(())) => tracing::info!("Scheduler stopped cleanly"),
        Ok(Err(e)) => tracing::error!(error = %e, "Scheduler task failed"),
        Err(_) => {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Shutdown grace period expired, abandoning in-flight items"
            );
            handle.abort();
            let _ = handle.join().await;
        }
    }
    db.close().await;

    if let Err(e) = status.clear() {
        tracing::warn!(error = %e, "Failed to remove service status");
    }
    tracing::info!("Service exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path(), dir.path());
        assert!(!take_trigger(&paths.trigger_file()));

        request_sync(&paths).unwrap();
        assert!(take_trigger(&paths.trigger_file()));
        assert!(!take_trigger(&paths.trigger_file()));
    }

    #[tokio::test]
    async fn test_refuses_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().join("data"), dir.path().join("config"));
        paths.ensure_dirs().unwrap();
        StatusFile::new(paths.status_file())
            .publish(std::process::id() + 1, ServiceState::Idle, Utc::now())
            .unwrap();

        let err = run(&paths).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}
