use futures::stream::{BoxStream, StreamExt};

use super::schema::Database;
use super::types::{BookmarkItem, BookmarkRow, ItemStatus, StatusCounts, StoreError};

const SELECT_ITEM: &str = r#"
    SELECT id, url, title, tags, content_type, local_path, status,
           last_synced_at, failure_count, article_path, video_path
    FROM bookmarks
"#;

impl Database {
    // ========================================================================
    // Bookmark Item Operations
    // ========================================================================

    /// Look up a single item by its remote id.
    pub async fn get(&self, id: &str) -> Result<Option<BookmarkItem>, StoreError> {
        let sql = format!("{SELECT_ITEM} WHERE id = ?");
        let row: Option<BookmarkRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BookmarkRow::into_item).transpose()
    }

    /// Insert or fully replace an item.
    ///
    /// A single `INSERT .. ON CONFLICT DO UPDATE` statement, so the row is
    /// replaced on commit or not at all. Callers guarantee that no two tasks
    /// write the same id concurrently; different ids may be written in parallel.
    pub async fn upsert(&self, item: &BookmarkItem) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&item.tags).map_err(|e| StoreError::Corruption {
            id: item.id.clone(),
            reason: format!("tags not serializable: {e}"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO bookmarks (id, url, title, tags, content_type, local_path, status,
                                   last_synced_at, failure_count, article_path, video_path)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                tags = excluded.tags,
                content_type = excluded.content_type,
                local_path = excluded.local_path,
                status = excluded.status,
                last_synced_at = excluded.last_synced_at,
                failure_count = excluded.failure_count,
                article_path = excluded.article_path,
                video_path = excluded.video_path
        "#,
        )
        .bind(&item.id)
        .bind(&item.url)
        .bind(&item.title)
        .bind(&tags)
        .bind(item.content_type.as_str())
        .bind(path_text(&item.local_path))
        .bind(item.status.as_str())
        .bind(item.last_synced_at.map(|t| t.timestamp()))
        .bind(i64::from(item.failure_count))
        .bind(path_text(&item.article_path))
        .bind(path_text(&item.video_path))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stream every stored item, ordered by id.
    ///
    /// The stream is lazy (rows are decoded as they are pulled) and
    /// restartable: each call runs a fresh query. A row that fails to decode
    /// yields `StoreError::Corruption` for that row only; iteration continues.
    pub fn list_all(&self) -> BoxStream<'_, Result<BookmarkItem, StoreError>> {
        sqlx::query_as::<_, BookmarkRow>(
            r#"
            SELECT id, url, title, tags, content_type, local_path, status,
                   last_synced_at, failure_count, article_path, video_path
            FROM bookmarks
            ORDER BY id
        "#,
        )
        .fetch(&self.pool)
        .map(|row| match row {
            Ok(row) => row.into_item(),
            Err(e) => Err(StoreError::Database(e)),
        })
        .boxed()
    }

    /// Apply a metadata-only change (title, tags) without touching sync state.
    pub async fn update_metadata(
        &self,
        id: &str,
        title: &str,
        tags: &[String],
    ) -> Result<bool, StoreError> {
        let tags = serde_json::to_string(tags).map_err(|e| StoreError::Corruption {
            id: id.to_string(),
            reason: format!("tags not serializable: {e}"),
        })?;
        let result = sqlx::query("UPDATE bookmarks SET title = ?, tags = ? WHERE id = ?")
            .bind(title)
            .bind(&tags)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the failure counter of every failed item so the next cycle
    /// retries them, including items that reached the retry ceiling.
    ///
    /// Returns the number of items reset.
    pub async fn reset_failures(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE bookmarks SET failure_count = 0 WHERE status = ? AND failure_count > 0",
        )
        .bind(ItemStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Count items per status.
    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bookmarks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Pending) => counts.pending = n,
                Ok(ItemStatus::Fetched) => counts.fetched = n,
                Ok(ItemStatus::Failed) => counts.failed = n,
                Ok(ItemStatus::Archived) => counts.archived = n,
                Err(reason) => {
                    tracing::warn!(status = %status, count = n, reason = %reason, "Unrecognised status in store");
                }
            }
        }
        Ok(counts)
    }
}

fn path_text(path: &Option<std::path::PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}
