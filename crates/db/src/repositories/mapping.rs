use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use clinicsync_core::identity::{EntityKind, EntityMapping};

use super::{MappingRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMappingRepository {
    pool: DbPool,
}

impl SqlMappingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MappingRepository for SqlMappingRepository {
    async fn load_all(&self) -> Result<Vec<EntityMapping>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                kind,
                entity_id,
                calendar_id,
                assigned_user_id,
                metadata_json,
                created_at,
                updated_at
             FROM entity_mapping
             ORDER BY kind ASC, entity_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(mapping_from_row).collect()
    }

    async fn replace_all(&self, mappings: Vec<EntityMapping>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entity_mapping").execute(&mut *tx).await?;

        for mapping in &mappings {
            let metadata_json = mapping
                .metadata
                .as_ref()
                .map(|value| serde_json::to_string(value))
                .transpose()
                .map_err(|error| RepositoryError::Decode(error.to_string()))?;

            sqlx::query(
                "INSERT INTO entity_mapping (
                    kind,
                    entity_id,
                    calendar_id,
                    assigned_user_id,
                    metadata_json,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(mapping.kind.as_str())
            .bind(&mapping.entity_id)
            .bind(mapping.calendar_id.as_deref())
            .bind(mapping.assigned_user_id.as_deref())
            .bind(metadata_json)
            .bind(mapping.created_at.to_rfc3339())
            .bind(mapping.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn mapping_from_row(row: SqliteRow) -> Result<EntityMapping, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = EntityKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown entity kind `{kind_raw}`")))?;

    let metadata = row
        .try_get::<Option<String>, _>("metadata_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(EntityMapping {
        kind,
        entity_id: row.try_get("entity_id")?,
        calendar_id: row.try_get("calendar_id")?,
        assigned_user_id: row.try_get("assigned_user_id")?,
        metadata,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {value}")))
}

#[cfg(test)]
mod tests {
    use clinicsync_core::identity::{EntityKind, EntityMapping};
    use serde_json::json;

    use super::SqlMappingRepository;
    use crate::repositories::MappingRepository;
    use crate::{connect_with_settings, migrations};

    async fn repo() -> SqlMappingRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlMappingRepository::new(pool)
    }

    #[tokio::test]
    async fn replace_all_is_wholesale() {
        let repo = repo().await;

        repo.replace_all(vec![
            EntityMapping::new(EntityKind::Service, "S1").with_calendar("C1"),
            EntityMapping::new(EntityKind::Doctor, "D1").with_assigned_user("U1"),
        ])
        .await
        .expect("seed mappings");

        repo.replace_all(vec![EntityMapping::new(EntityKind::Site, "X1").with_calendar("C2")])
            .await
            .expect("replace mappings");

        let loaded = repo.load_all().await.expect("load mappings");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].entity_id, "X1");
        assert_eq!(loaded[0].calendar_id.as_deref(), Some("C2"));
    }

    #[tokio::test]
    async fn metadata_blob_round_trips() {
        let repo = repo().await;
        let mut mapping = EntityMapping::new(EntityKind::Site, "X1").with_calendar("C1");
        mapping.metadata = Some(json!({ "default_site_id": "X1", "address": "Via Roma 1" }));

        repo.replace_all(vec![mapping.clone()]).await.expect("save mapping");
        let loaded = repo.load_all().await.expect("load mappings");

        assert_eq!(loaded[0].metadata, mapping.metadata);
    }
}
