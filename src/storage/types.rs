use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store-level errors.
///
/// `Corruption` is scoped to a single record: callers log it and leave that
/// item in its last-known-good state while the rest of the store stays usable.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A stored record could not be decoded into a valid item
    #[error("Corrupt record for item '{id}': {reason}")]
    Corruption { id: String, reason: String },

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Filesystem error while preparing the store location
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of content a bookmark points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Article,
    Video,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Article => "article",
            ContentType::Video => "video",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ContentType::Article),
            "video" => Ok(ContentType::Video),
            other => Err(format!("unknown content type '{other}'")),
        }
    }
}

/// Sync status of a bookmark item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    Fetched,
    Failed,
    Archived,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Fetched => "fetched",
            ItemStatus::Failed => "failed",
            ItemStatus::Archived => "archived",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "fetched" => Ok(ItemStatus::Fetched),
            "failed" => Ok(ItemStatus::Failed),
            "archived" => Ok(ItemStatus::Archived),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall result of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Catalog listed completely and no item failed
    Success,
    /// Catalog listed completely but at least one item failed
    PartialFailure,
    /// The catalog listing itself failed; no archival and no fetches happened
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::PartialFailure => "partial_failure",
            CycleOutcome::Failed => "failed",
        }
    }
}

impl FromStr for CycleOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CycleOutcome::Success),
            "partial_failure" => Ok(CycleOutcome::PartialFailure),
            "failed" => Ok(CycleOutcome::Failed),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// One bookmark as known locally.
///
/// `article_path` / `video_path` record where each content facet was
/// committed, independently of `status`, which is the single surfaced summary
/// of them. `local_path` mirrors `article_path` while the item is `Fetched`
/// or `Archived`.
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkItem {
    pub id: String,
    pub url: String,
    pub title: String,
    pub tags: Vec<String>,
    pub content_type: ContentType,
    pub local_path: Option<PathBuf>,
    pub status: ItemStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub article_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
}

impl BookmarkItem {
    /// A freshly discovered item that has not been fetched yet.
    pub fn pending(
        id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        tags: Vec<String>,
        content_type: ContentType,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: title.into(),
            tags,
            content_type,
            local_path: None,
            status: ItemStatus::Pending,
            last_synced_at: None,
            failure_count: 0,
            article_path: None,
            video_path: None,
        }
    }
}

/// Append-only record of one executed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCycleRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub items_added: u32,
    pub items_archived: u32,
    pub items_failed: u32,
    /// A stop request interrupted the cycle between items
    pub cancelled: bool,
}

/// Number of items per status, for the status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub fetched: i64,
    pub failed: i64,
    pub archived: i64,
}

// ============================================================================
// Row Types
// ============================================================================

/// Raw `bookmarks` row; decoded into [`BookmarkItem`] via [`BookmarkRow::into_item`].
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BookmarkRow {
    pub id: String,
    pub url: String,
    pub title: String,
    pub tags: String,
    pub content_type: String,
    pub local_path: Option<String>,
    pub status: String,
    pub last_synced_at: Option<i64>,
    pub failure_count: i64,
    pub article_path: Option<String>,
    pub video_path: Option<String>,
}

impl BookmarkRow {
    pub(crate) fn into_item(self) -> Result<BookmarkItem, StoreError> {
        let corrupt = |reason: String| StoreError::Corruption {
            id: self.id.clone(),
            reason,
        };

        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| corrupt(format!("tags are not a JSON string array: {e}")))?;
        let content_type = self.content_type.parse::<ContentType>().map_err(corrupt)?;
        let status = self.status.parse::<ItemStatus>().map_err(corrupt)?;
        let failure_count = u32::try_from(self.failure_count)
            .map_err(|_| corrupt(format!("negative failure count {}", self.failure_count)))?;
        let last_synced_at = match self.last_synced_at {
            Some(secs) => Some(
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| corrupt(format!("timestamp {secs} out of range")))?,
            ),
            None => None,
        };

        // localPath is present exactly for fetched items (and archived copies of them)
        if status == ItemStatus::Fetched && self.local_path.is_none() {
            return Err(corrupt("fetched item without a local path".to_string()));
        }
        if matches!(status, ItemStatus::Pending | ItemStatus::Failed) && self.local_path.is_some() {
            return Err(corrupt(format!("{status} item with a local path")));
        }

        Ok(BookmarkItem {
            id: self.id,
            url: self.url,
            title: self.title,
            tags,
            content_type,
            local_path: self.local_path.map(PathBuf::from),
            status,
            last_synced_at,
            failure_count,
            article_path: self.article_path.map(PathBuf::from),
            video_path: self.video_path.map(PathBuf::from),
        })
    }
}

/// Raw `sync_cycles` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CycleRow {
    pub started_at: i64,
    pub finished_at: i64,
    pub outcome: String,
    pub items_added: i64,
    pub items_archived: i64,
    pub items_failed: i64,
    pub cancelled: bool,
}

impl CycleRow {
    pub(crate) fn into_record(self) -> Result<SyncCycleRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corruption {
            id: format!("cycle@{}", self.started_at),
            reason,
        };
        let ts = |secs: i64| {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| corrupt(format!("timestamp {secs} out of range")))
        };
        let count = |n: i64| u32::try_from(n).map_err(|_| corrupt(format!("invalid count {n}")));

        Ok(SyncCycleRecord {
            started_at: ts(self.started_at)?,
            finished_at: ts(self.finished_at)?,
            outcome: self.outcome.parse::<CycleOutcome>().map_err(corrupt)?,
            items_added: count(self.items_added)?,
            items_archived: count(self.items_archived)?,
            items_failed: count(self.items_failed)?,
            cancelled: self.cancelled,
        })
    }
}
