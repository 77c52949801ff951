//! Synchronization engine: reconciler, cycle executor and scheduler.

mod clock;
mod executor;
mod reconcile;
mod scheduler;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::content::{ArticleFetcher, DownloadLayout, VideoFetcher, WebFetcher};
use crate::remote::RaindropClient;
use crate::storage::{Database, StoreError, SyncCycleRecord};
use crate::util::RetryPolicy;

pub use clock::{Clock, SystemClock};
pub use executor::{CycleExecutor, CycleSettings};
pub use reconcile::{
    plan, Action, ActionKind, CatalogSnapshot, LocalSnapshot, PlanPolicy, RefetchReason,
};
pub use scheduler::{initial_delay, spawn, SchedulerCore, SchedulerHandle, SchedulerState};

/// Reasons a cycle could not run at all.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot prepare download folder: {0}")]
    Layout(#[source] std::io::Error),

    #[error("Cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Runs one complete cycle. The scheduler's only dependency.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<SyncCycleRecord, SyncError>;
}

/// Production runner: re-reads the configuration and rebuilds the
/// collaborators at the start of every cycle.
pub struct ConfiguredRunner {
    config_path: PathBuf,
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ConfiguredRunner {
    pub fn new(config_path: PathBuf, db: Database) -> Self {
        Self {
            config_path,
            db,
            clock: Arc::new(SystemClock),
        }
    }

    async fn build_executor(&self) -> Result<CycleExecutor, SyncError> {
        let config = Config::load(&self.config_path)?;
        let token = config.require_token()?;

        let layout = DownloadLayout::prepare(&config.download_path)
            .await
            .map_err(SyncError::Layout)?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .build()?;
        let policy = RetryPolicy::with_timeout(config.request_timeout());

        let catalog = RaindropClient::new(http.clone(), &config.api_base_url, token, policy);
        let article = ArticleFetcher::new(
            http,
            config.article_format,
            &config.reader_base_url,
            policy,
        );
        let video = VideoFetcher::new(config.yt_dlp_path.clone(), layout.staging_dir(), policy);

        let settings = CycleSettings {
            retry_ceiling: config.retry_ceiling,
            video_enabled: config.video_enabled,
            video_resolution: config.video_resolution,
            concurrency: config.concurrency,
        };

        tracing::debug!(root = %layout.root().display(), ?settings, "Cycle configuration loaded");

        Ok(CycleExecutor::new(
            self.db.clone(),
            Arc::new(catalog),
            Arc::new(WebFetcher::new(article, video)),
            layout,
            settings,
            self.clock.clone(),
        ))
    }
}

#[async_trait]
impl CycleRunner for ConfiguredRunner {
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<SyncCycleRecord, SyncError> {
        let executor = match self.build_executor().await {
            Ok(executor) => executor,
            Err(e) => {
                tracing::error!(error = %e, "Sync cycle skipped");
                return Err(e);
            }
        };
        Ok(executor.run(&cancel).await?)
    }
}
