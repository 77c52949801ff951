use super::schema::Database;
use super::types::{CycleOutcome, CycleRow, StoreError, SyncCycleRecord};

impl Database {
    // ========================================================================
    // Sync Cycle Log
    // ========================================================================

    /// Append a finalized cycle record. Returns its row id.
    pub async fn append_cycle_record(&self, record: &SyncCycleRecord) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_cycles
                (started_at, finished_at, outcome, items_added, items_archived, items_failed, cancelled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(record.started_at.timestamp())
        .bind(record.finished_at.timestamp())
        .bind(record.outcome.as_str())
        .bind(i64::from(record.items_added))
        .bind(i64::from(record.items_archived))
        .bind(i64::from(record.items_failed))
        .bind(record.cancelled)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent cycle records, newest first.
    pub async fn recent_cycles(&self, limit: i64) -> Result<Vec<SyncCycleRecord>, StoreError> {
        let rows: Vec<CycleRow> = sqlx::query_as(
            r#"
            SELECT started_at, finished_at, outcome, items_added, items_archived, items_failed, cancelled
            FROM sync_cycles
            ORDER BY id DESC
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CycleRow::into_record).collect()
    }

    /// The latest cycle whose catalog listing succeeded.
    ///
    /// Used by the scheduler to decide whether a sync was missed while the
    /// service was not running.
    pub async fn last_completed_cycle(&self) -> Result<Option<SyncCycleRecord>, StoreError> {
        let row: Option<CycleRow> = sqlx::query_as(
            r#"
            SELECT started_at, finished_at, outcome, items_added, items_archived, items_failed, cancelled
            FROM sync_cycles
            WHERE outcome != ?
            ORDER BY id DESC
            LIMIT 1
        "#,
        )
        .bind(CycleOutcome::Failed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CycleRow::into_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{CycleOutcome, Database, SyncCycleRecord};
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn record(start: i64, outcome: CycleOutcome) -> SyncCycleRecord {
        SyncCycleRecord {
            started_at: at(start),
            finished_at: at(start + 10),
            outcome,
            items_added: 2,
            items_archived: 1,
            items_failed: 0,
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back_newest_first() {
        let db = test_db().await;
        db.append_cycle_record(&record(100, CycleOutcome::Success))
            .await
            .unwrap();
        db.append_cycle_record(&record(200, CycleOutcome::PartialFailure))
            .await
            .unwrap();

        let cycles = db.recent_cycles(10).await.unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0], record(200, CycleOutcome::PartialFailure));
        assert_eq!(cycles[1], record(100, CycleOutcome::Success));
    }

    #[tokio::test]
    async fn test_last_completed_skips_failed_cycles() {
        let db = test_db().await;
        assert!(db.last_completed_cycle().await.unwrap().is_none());

        db.append_cycle_record(&record(100, CycleOutcome::Success))
            .await
            .unwrap();
        db.append_cycle_record(&record(200, CycleOutcome::Failed))
            .await
            .unwrap();

        let last = db.last_completed_cycle().await.unwrap().unwrap();
        assert_eq!(last.started_at, at(100));
    }

    #[tokio::test]
    async fn test_cycle_records_are_immutable() {
        let db = test_db().await;
        db.append_cycle_record(&record(100, CycleOutcome::Success))
            .await
            .unwrap();

        let update = sqlx::query("UPDATE sync_cycles SET outcome = 'failed'")
            .execute(&db.pool)
            .await;
        assert!(update.is_err());
    }
}
