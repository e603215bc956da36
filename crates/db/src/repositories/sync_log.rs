use sqlx::{sqlite::SqliteRow, Row};

use clinicsync_core::domain::sync_log::{SyncAction, SyncLogEntry, SyncStatus};

use super::mapping::parse_timestamp;
use super::{RepositoryError, SyncLogRepository};
use crate::DbPool;

pub struct SqlSyncLogRepository {
    pool: DbPool,
}

impl SqlSyncLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SyncLogRepository for SqlSyncLogRepository {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO sync_log (
                id,
                event_type,
                entity_id,
                action,
                status,
                error_message,
                duration_ms,
                processed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.event_type)
        .bind(&entry.entity_id)
        .bind(entry.action.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.duration_ms)
        .bind(entry.processed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<SyncLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                event_type,
                entity_id,
                action,
                status,
                error_message,
                duration_ms,
                processed_at
             FROM sync_log
             ORDER BY processed_at DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: SqliteRow) -> Result<SyncLogEntry, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = SyncAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sync action `{action_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = SyncStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sync status `{status_raw}`")))?;

    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        entity_id: row.try_get("entity_id")?,
        action,
        status,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
        processed_at: parse_timestamp("processed_at", row.try_get("processed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use clinicsync_core::domain::sync_log::{SyncAction, SyncLogEntry, SyncStatus};

    use super::SqlSyncLogRepository;
    use crate::repositories::SyncLogRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn appended_entries_come_back_most_recent_first() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlSyncLogRepository::new(pool);

        let mut first = SyncLogEntry::record(
            "booking.created",
            "B1",
            SyncAction::Create,
            SyncStatus::Success,
            None,
            Some(120),
        );
        first.processed_at -= chrono::Duration::seconds(10);
        let second = SyncLogEntry::record(
            "booking.cancelled",
            "B1",
            SyncAction::Delete,
            SyncStatus::Error,
            Some("crm request failed".to_owned()),
            Some(340),
        );

        repo.append(first).await.expect("append first");
        repo.append(second).await.expect("append second");

        let recent = repo.recent(10).await.expect("list recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "booking.cancelled");
        assert_eq!(recent[0].status, SyncStatus::Error);
        assert_eq!(recent[1].event_type, "booking.created");
    }
}
