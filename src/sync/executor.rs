//! Apply one action plan against the store and the download folder.

use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::reconcile::{
    self, Action, CatalogSnapshot, LocalSnapshot, MetadataUpdate, PlanPolicy, RefetchReason,
};
use crate::content::{ContentFetcher, DownloadLayout, Facet, FetchError, VideoResolution};
use crate::remote::{catalog_stream, CatalogClient, RemoteBookmark};
use crate::storage::{
    BookmarkItem, ContentType, CycleOutcome, Database, ItemStatus, StoreError, SyncCycleRecord,
};

/// Per-cycle settings, taken from the configuration read at cycle start.
#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub retry_ceiling: u32,
    pub video_enabled: bool,
    pub video_resolution: VideoResolution,
    pub concurrency: usize,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            video_enabled: false,
            video_resolution: VideoResolution::default(),
            concurrency: 3,
        }
    }
}

/// What happened to one `Add`/`Refetch` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Fetched,
    Failed,
    /// Not started because the cycle was cancelled.
    Skipped,
}

/// Runs sync cycles: list, reconcile, fetch, archive, record.
pub struct CycleExecutor {
    db: Database,
    catalog: Arc<dyn CatalogClient>,
    fetcher: Arc<dyn ContentFetcher>,
    layout: DownloadLayout,
    settings: CycleSettings,
    clock: Arc<dyn Clock>,
}

impl CycleExecutor {
    pub fn new(
        db: Database,
        catalog: Arc<dyn CatalogClient>,
        fetcher: Arc<dyn ContentFetcher>,
        layout: DownloadLayout,
        settings: CycleSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            catalog,
            fetcher,
            layout,
            settings,
            clock,
        }
    }

    /// Execute one full cycle and append its record.
    ///
    /// Per-item failures are absorbed into the record. An `Err` means the
    /// store itself could not be read or the record could not be written.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncCycleRecord, StoreError> {
        let started_at = self.clock.now();
        tracing::info!("Sync cycle started");

        let snapshot = CatalogSnapshot::collect(catalog_stream(self.catalog.as_ref())).await;
        let local = self.load_local().await?;
        let policy = PlanPolicy {
            retry_ceiling: self.settings.retry_ceiling,
            video_enabled: self.settings.video_enabled,
        };
        let plan = reconcile::plan(&snapshot, &local, &policy);

        let mut record = SyncCycleRecord {
            started_at,
            finished_at: started_at,
            outcome: CycleOutcome::Success,
            items_added: 0,
            items_archived: 0,
            items_failed: 0,
            cancelled: false,
        };

        if let Some(error) = &snapshot.error {
            tracing::error!(error = %error, listed = snapshot.items.len(), "Catalog unavailable, skipping fetches and archival");
            self.apply_metadata_only(&plan).await;
            record.outcome = CycleOutcome::Failed;
            return self.finish(record).await;
        }

        let mut fetch_actions = Vec::new();
        for action in plan {
            match action {
                Action::Archive { local } => {
                    if cancel.is_cancelled() {
                        record.cancelled = true;
                        continue;
                    }
                    match self.archive_item(local).await {
                        Ok(()) => record.items_archived += 1,
                        Err(e) => tracing::error!(error = %e, "Failed to archive item"),
                    }
                }
                Action::Add { remote } => fetch_actions.push((remote, None, None)),
                Action::Refetch {
                    remote,
                    local,
                    reason,
                } => fetch_actions.push((remote, Some(local), Some(reason))),
                Action::NoOp { id, metadata } => {
                    if let Some(update) = metadata {
                        self.apply_metadata(&id, &update).await;
                    }
                }
            }
        }

        let results: Vec<(bool, ItemResult)> = stream::iter(fetch_actions)
            .map(|(remote, local, reason)| async move {
                let is_add = local.is_none();
                (is_add, self.fetch_item(remote, local, reason, cancel).await)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (is_add, result) in results {
            match result {
                ItemResult::Skipped => record.cancelled = true,
                ItemResult::Failed => record.items_failed += 1,
                ItemResult::Fetched => {}
            }
            // An add that never started created no row
            if is_add && result != ItemResult::Skipped {
                record.items_added += 1;
            }
        }
        record.outcome = if record.items_failed == 0 {
            CycleOutcome::Success
        } else {
            CycleOutcome::PartialFailure
        };

        self.finish(record).await
    }

    async fn finish(&self, mut record: SyncCycleRecord) -> Result<SyncCycleRecord, StoreError> {
        record.finished_at = self.clock.now();
        self.db.append_cycle_record(&record).await?;
        tracing::info!(
            outcome = %record.outcome,
            added = record.items_added,
            archived = record.items_archived,
            failed = record.items_failed,
            cancelled = record.cancelled,
            "Sync cycle finished"
        );
        Ok(record)
    }

    /// Snapshot of local items. Corrupt rows are logged and set aside so
    /// the plan leaves them untouched.
    async fn load_local(&self) -> Result<LocalSnapshot, StoreError> {
        let mut local = LocalSnapshot::default();
        let mut rows = self.db.list_all();
        while let Some(row) = rows.next().await {
            match row {
                Ok(item) => local.items.push(item),
                Err(StoreError::Corruption { id, reason }) => {
                    tracing::error!(item_id = %id, reason = %reason, "Skipping corrupt item");
                    local.corrupt.insert(id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(local)
    }

    async fn apply_metadata_only(&self, plan: &[Action]) {
        for action in plan {
            match action {
                Action::NoOp {
                    id,
                    metadata: Some(update),
                } => self.apply_metadata(id, update).await,
                Action::Refetch { remote, local, .. }
                    if remote.title != local.title || remote.tags != local.tags =>
                {
                    let update = MetadataUpdate {
                        title: remote.title.clone(),
                        tags: remote.tags.clone(),
                    };
                    self.apply_metadata(&local.id, &update).await;
                }
                _ => {}
            }
        }
    }

    async fn apply_metadata(&self, id: &str, update: &MetadataUpdate) {
        if let Err(e) = self
            .db
            .update_metadata(id, &update.title, &update.tags)
            .await
        {
            tracing::warn!(item_id = %id, error = %e, "Failed to update metadata");
        }
    }

    async fn archive_item(&self, mut item: BookmarkItem) -> Result<(), StoreError> {
        if let Some(path) = item.article_path.take() {
            item.article_path = Some(self.move_facet(&item.id, Facet::Article, path, true).await);
        }
        if let Some(path) = item.video_path.take() {
            item.video_path = Some(self.move_facet(&item.id, Facet::Video, path, true).await);
        }

        // Only previously fetched content keeps a path
        item.local_path = match item.status {
            ItemStatus::Fetched => item.article_path.clone(),
            _ => None,
        };
        item.status = ItemStatus::Archived;
        self.db.upsert(&item).await?;
        tracing::info!(item_id = %item.id, "Archived item removed from catalog");
        Ok(())
    }

    /// Move one committed file to or from the archive.
    ///
    /// Returns the path to record; a missing or unmovable file keeps its old path.
    async fn move_facet(&self, id: &str, facet: Facet, path: PathBuf, to_archive: bool) -> PathBuf {
        let moved = if to_archive {
            self.layout.archive(facet, &path).await
        } else {
            self.layout.restore(facet, &path).await
        };
        match moved {
            Ok(Some(new_path)) => new_path,
            Ok(None) => {
                tracing::warn!(item_id = %id, path = %path.display(), "Content file missing on disk");
                path
            }
            Err(e) => {
                tracing::warn!(item_id = %id, path = %path.display(), error = %e, "Failed to move content file");
                path
            }
        }
    }

    async fn fetch_item(
        &self,
        remote: RemoteBookmark,
        local: Option<BookmarkItem>,
        reason: Option<RefetchReason>,
        cancel: &CancellationToken,
    ) -> ItemResult {
        // Cancellation is observed between items only
        if cancel.is_cancelled() {
            return ItemResult::Skipped;
        }

        let id = remote.id.clone();
        match self.fetch_item_inner(remote, local, reason).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(item_id = %id, error = %e, "Failed to persist item");
                ItemResult::Failed
            }
        }
    }

    async fn fetch_item_inner(
        &self,
        remote: RemoteBookmark,
        local: Option<BookmarkItem>,
        reason: Option<RefetchReason>,
    ) -> Result<ItemResult, StoreError> {
        let mut item = match local {
            Some(mut item) => {
                item.url = remote.url;
                item.title = remote.title;
                item.tags = remote.tags;
                item.content_type = remote.content_type;
                item
            }
            None => {
                let item = BookmarkItem::pending(
                    remote.id,
                    remote.url,
                    remote.title,
                    remote.tags,
                    remote.content_type,
                );
                self.db.upsert(&item).await?;
                tracing::debug!(item_id = %item.id, "New item recorded");
                item
            }
        };

        match reason {
            Some(RefetchReason::SourceChanged) => {
                item.article_path = None;
                item.video_path = None;
            }
            Some(RefetchReason::Restored) => {
                if let Some(path) = item.article_path.take() {
                    item.article_path =
                        Some(self.move_facet(&item.id, Facet::Article, path, false).await);
                }
                if let Some(path) = item.video_path.take() {
                    item.video_path =
                        Some(self.move_facet(&item.id, Facet::Video, path, false).await);
                }
            }
            _ => {}
        }

        let mut all_ok = true;

        if !facet_present(&item.article_path).await {
            match self.fetch_article(&item).await {
                Ok(path) => item.article_path = Some(path),
                Err(e) => {
                    tracing::warn!(item_id = %item.id, url = %item.url, error = %e, "Article fetch failed");
                    item.article_path = None;
                    all_ok = false;
                }
            }
        }

        let wants_video = self.settings.video_enabled && item.content_type == ContentType::Video;
        if wants_video && !facet_present(&item.video_path).await {
            match self.fetch_video(&item).await {
                Ok(path) => item.video_path = Some(path),
                Err(e) => {
                    tracing::warn!(item_id = %item.id, url = %item.url, error = %e, "Video fetch failed");
                    item.video_path = None;
                    all_ok = false;
                }
            }
        }

        if all_ok {
            item.status = ItemStatus::Fetched;
            item.local_path = item.article_path.clone();
            item.failure_count = 0;
            item.last_synced_at = Some(self.clock.now());
            tracing::info!(item_id = %item.id, "Item fetched");
        } else {
            item.status = ItemStatus::Failed;
            item.local_path = None;
            item.failure_count = item.failure_count.saturating_add(1);
            if item.failure_count >= self.settings.retry_ceiling {
                tracing::warn!(
                    item_id = %item.id,
                    failures = item.failure_count,
                    "Retry ceiling reached, item will not be retried automatically"
                );
            }
        }

        self.db.upsert(&item).await?;
        Ok(if all_ok {
            ItemResult::Fetched
        } else {
            ItemResult::Failed
        })
    }

    async fn fetch_article(&self, item: &BookmarkItem) -> Result<PathBuf, FetchError> {
        let content = self.fetcher.fetch_article(&item.url).await?;
        Ok(self
            .layout
            .commit(Facet::Article, &item.title, &item.id, content)
            .await?)
    }

    async fn fetch_video(&self, item: &BookmarkItem) -> Result<PathBuf, FetchError> {
        let content = self
            .fetcher
            .fetch_video(&item.url, self.settings.video_resolution)
            .await?;
        Ok(self
            .layout
            .commit(Facet::Video, &item.title, &item.id, content)
            .await?)
    }
}

/// A facet counts as done only while its file still exists.
async fn facet_present(path: &Option<PathBuf>) -> bool {
    match path {
        Some(p) => tokio::fs::try_exists(p).await.unwrap_or(false),
        None => false,
    }
}
