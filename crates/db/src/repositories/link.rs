use sqlx::{sqlite::SqliteRow, Row};

use clinicsync_core::domain::link::EventLink;

use super::mapping::parse_timestamp;
use super::{LinkRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLinkRepository {
    pool: DbPool,
}

impl SqlLinkRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LinkRepository for SqlLinkRepository {
    async fn find_by_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<EventLink>, RepositoryError> {
        let row = sqlx::query(
            "SELECT booking_id, event_id, calendar_id, created_at
             FROM event_link
             WHERE booking_id = ?",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(link_from_row).transpose()
    }

    async fn save(&self, link: EventLink) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO event_link (booking_id, event_id, calendar_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(booking_id) DO UPDATE SET
                event_id = excluded.event_id,
                calendar_id = excluded.calendar_id",
        )
        .bind(&link.booking_id)
        .bind(&link.event_id)
        .bind(link.calendar_id.as_deref())
        .bind(link.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, booking_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM event_link WHERE booking_id = ?")
            .bind(booking_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn link_from_row(row: SqliteRow) -> Result<EventLink, RepositoryError> {
    Ok(EventLink {
        booking_id: row.try_get("booking_id")?,
        event_id: row.try_get("event_id")?,
        calendar_id: row.try_get("calendar_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
