//! Periodic and on-demand cycle triggering with at most one cycle in flight.
//!
//! [`SchedulerCore`] is the pure state machine; [`spawn`] drives it from a
//! tokio interval, a command channel and the running cycle's task.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use super::{CycleRunner, SyncError};
use crate::storage::SyncCycleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        }
    }
}

/// Scheduler state machine. Each `on_*` method returns whether the caller
/// must start a cycle now.
#[derive(Debug)]
pub struct SchedulerCore {
    state: SchedulerState,
    rerun_requested: bool,
}

impl Default for SchedulerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerCore {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            rerun_requested: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn rerun_requested(&self) -> bool {
        self.rerun_requested
    }

    /// Interval timer fired. Dropped unless idle.
    pub fn on_tick(&mut self) -> bool {
        match self.state {
            SchedulerState::Idle => {
                self.state = SchedulerState::Running;
                true
            }
            SchedulerState::Running | SchedulerState::Stopping => false,
        }
    }

    /// Manual trigger. While running, coalesced into one follow-up run.
    pub fn on_manual(&mut self) -> bool {
        match self.state {
            SchedulerState::Idle => {
                self.state = SchedulerState::Running;
                true
            }
            SchedulerState::Running => {
                self.rerun_requested = true;
                false
            }
            SchedulerState::Stopping => false,
        }
    }

    /// The in-flight cycle ended.
    pub fn on_cycle_finished(&mut self) -> bool {
        match self.state {
            SchedulerState::Running if self.rerun_requested => {
                self.rerun_requested = false;
                true
            }
            SchedulerState::Running => {
                self.state = SchedulerState::Idle;
                false
            }
            SchedulerState::Idle | SchedulerState::Stopping => false,
        }
    }

    /// Stop requested. Returns true when a cycle is still in flight.
    pub fn on_stop(&mut self) -> bool {
        let busy = self.state == SchedulerState::Running;
        self.state = SchedulerState::Stopping;
        self.rerun_requested = false;
        busy
    }
}

/// Delay before the first scheduled cycle.
///
/// Runs immediately when no cycle completed yet or the last one finished at
/// least one interval ago; otherwise waits out the remainder.
pub fn initial_delay(
    now: DateTime<Utc>,
    last_completed: Option<DateTime<Utc>>,
    interval: Duration,
) -> Duration {
    let Some(last) = last_completed else {
        return Duration::ZERO;
    };
    // A last cycle in the future (clock moved back) counts as just finished
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

#[derive(Debug)]
enum Command {
    SyncNow,
    Stop,
}

/// Control surface of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a cycle now (coalesced if one is running).
    pub fn sync_now(&self) {
        let _ = self.commands.send(Command::SyncNow);
    }

    /// Request shutdown. The running cycle finishes its in-flight items.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Wait for the driver to exit (after `stop`).
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }

    /// Abort the driver. The in-flight cycle is dropped with it, abandoning
    /// its current items.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start the scheduler driver on the current runtime.
pub fn spawn(
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    first_delay: Duration,
) -> SchedulerHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(SchedulerState::Idle);
    let first_tick = Instant::now() + first_delay;
    let task = tokio::spawn(drive(runner, interval, first_tick, rx, state_tx));
    SchedulerHandle {
        commands,
        state,
        task,
    }
}

type CycleTask = AbortOnDropHandle<Result<SyncCycleRecord, SyncError>>;

async fn wait_cycle(task: &mut Option<CycleTask>) -> Result<Result<SyncCycleRecord, SyncError>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn drive(
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    first_tick: Instant,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SchedulerState>,
) {
    let mut core = SchedulerCore::new();
    let shutdown = CancellationToken::new();
    let mut in_flight: Option<CycleTask> = None;

    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        interval_secs = interval.as_secs(),
        first_in_secs = first_tick.saturating_duration_since(Instant::now()).as_secs(),
        "Scheduler started"
    );

    let start_cycle = |in_flight: &mut Option<CycleTask>| {
        let runner = runner.clone();
        let token = shutdown.child_token();
        *in_flight = Some(AbortOnDropHandle::new(tokio::spawn(async move {
            runner.run_cycle(token).await
        })));
    };

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if core.on_tick() {
                    start_cycle(&mut in_flight);
                } else {
                    tracing::debug!(state = core.state().as_str(), "Timer fired during a cycle, dropped");
                }
            }
            command = commands.recv() => match command {
                Some(Command::SyncNow) => {
                    if core.on_manual() {
                        tracing::info!("Manual sync started");
                        start_cycle(&mut in_flight);
                    } else {
                        tracing::info!("Manual sync queued after the current cycle");
                    }
                }
                // All handles dropped counts as a stop request
                Some(Command::Stop) | None => {
                    let busy = core.on_stop();
                    shutdown.cancel();
                    tracing::info!(cycle_in_flight = busy, "Scheduler stopping");
                    if !busy {
                        break;
                    }
                }
            },
            result = wait_cycle(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                match result {
                    Ok(Ok(record)) => tracing::debug!(outcome = %record.outcome, "Cycle task finished"),
                    Ok(Err(e)) => tracing::error!(error = %e, "Sync cycle aborted, retrying at next tick"),
                    Err(e) => tracing::error!(error = %e, "Sync cycle task panicked"),
                }
                if core.on_cycle_finished() {
                    tracing::info!("Running queued manual sync");
                    start_cycle(&mut in_flight);
                } else if core.state() == SchedulerState::Stopping {
                    break;
                }
            }
        }
        state_tx.send_replace(core.state());
    }

    state_tx.send_replace(SchedulerState::Stopping);
    tracing::info!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[test]
    fn test_tick_starts_only_when_idle() {
        let mut core = SchedulerCore::new();
        assert!(core.on_tick());
        assert_eq!(core.state(), SchedulerState::Running);
        assert!(!core.on_tick());
        assert!(!core.on_cycle_finished());
        assert_eq!(core.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_manual_while_running_is_coalesced() {
        let mut core = SchedulerCore::new();
        assert!(core.on_tick());
        assert!(!core.on_manual());
        assert!(!core.on_manual());
        assert!(core.rerun_requested());

        // Exactly one follow-up
        assert!(core.on_cycle_finished());
        assert_eq!(core.state(), SchedulerState::Running);
        assert!(!core.on_cycle_finished());
        assert_eq!(core.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_stop_while_running_waits_for_cycle() {
        let mut core = SchedulerCore::new();
        core.on_tick();
        core.on_manual();
        assert!(core.on_stop());
        assert_eq!(core.state(), SchedulerState::Stopping);
        assert!(!core.on_cycle_finished());
        assert!(!core.on_tick());
        assert!(!core.on_manual());
    }

    #[test]
    fn test_stop_while_idle() {
        let mut core = SchedulerCore::new();
        assert!(!core.on_stop());
    }

    #[test]
    fn test_initial_delay() {
        let interval = Duration::from_secs(3600);
        let now = DateTime::from_timestamp(10_000, 0).unwrap();
        assert_eq!(initial_delay(now, None, interval), Duration::ZERO);

        let recent = DateTime::from_timestamp(10_000 - 600, 0);
        assert_eq!(initial_delay(now, recent, interval), Duration::from_secs(3000));

        let stale = DateTime::from_timestamp(10_000 - 7200, 0);
        assert_eq!(initial_delay(now, stale, interval), Duration::ZERO);

        let future = DateTime::from_timestamp(10_000 + 60, 0);
        assert_eq!(initial_delay(now, future, interval), interval);
    }

    /// Runner whose cycles block until released; tracks overlap.
    #[derive(Default)]
    struct GatedRunner {
        started: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl CycleRunner for GatedRunner {
        async fn run_cycle(&self, _cancel: CancellationToken) -> Result<SyncCycleRecord, SyncError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Err(SyncError::Config(ConfigError::Invalid("test cycle".to_string())))
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_drives_cycles() {
        let runner = Arc::new(GatedRunner::default());
        let mut handle = spawn(runner.clone(), Duration::from_secs(60), Duration::ZERO);

        settle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
        runner.release.notify_one();
        settle().await;
        assert_eq!(handle.state(), SchedulerState::Idle);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 2);
        runner.release.notify_one();

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_cycles_at_once() {
        let runner = Arc::new(GatedRunner::default());
        let mut handle = spawn(runner.clone(), Duration::from_secs(60), Duration::ZERO);
        settle().await;

        // Ticks and manual triggers while the first cycle is blocked
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(60)).await;
            handle.sync_now();
            settle().await;
        }
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), SchedulerState::Running);

        // Release: exactly one coalesced follow-up
        runner.release.notify_one();
        settle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 2);
        runner.release.notify_one();
        settle().await;
        assert_eq!(handle.state(), SchedulerState::Idle);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_delay_respected() {
        let runner = Arc::new(GatedRunner::default());
        let mut handle = spawn(runner.clone(), Duration::from_secs(600), Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(119)).await;
        settle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
        runner.release.notify_one();

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_cycle() {
        let runner = Arc::new(GatedRunner::default());
        let mut handle = spawn(runner.clone(), Duration::from_secs(60), Duration::ZERO);
        settle().await;
        assert_eq!(handle.state(), SchedulerState::Running);

        handle.stop();
        settle().await;
        assert_eq!(handle.state(), SchedulerState::Stopping);
        assert!(!handle.task.is_finished());

        runner.release.notify_one();
        handle.join().await.unwrap();
        assert_eq!(runner.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drops_in_flight_cycle() {
        let runner = Arc::new(GatedRunner::default());
        let handle = spawn(runner.clone(), Duration::from_secs(60), Duration::ZERO);
        settle().await;
        assert_eq!(handle.state(), SchedulerState::Running);

        handle.abort();
        settle().await;
        assert!(handle.task.is_finished());
        // Neither the driver nor the cycle still holds the runner
        assert_eq!(Arc::strong_count(&runner), 1);
    }
}
