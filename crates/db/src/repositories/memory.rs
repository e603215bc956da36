//! In-memory repositories: the no-database fallback and the test doubles.

use std::collections::HashMap;

use tokio::sync::RwLock;

use clinicsync_core::domain::link::EventLink;
use clinicsync_core::domain::sync_log::SyncLogEntry;
use clinicsync_core::identity::EntityMapping;

use super::{LinkRepository, MappingRepository, RepositoryError, SyncLogRepository};

#[derive(Default)]
pub struct InMemoryMappingRepository {
    mappings: RwLock<Vec<EntityMapping>>,
}

#[async_trait::async_trait]
impl MappingRepository for InMemoryMappingRepository {
    async fn load_all(&self) -> Result<Vec<EntityMapping>, RepositoryError> {
        let mappings = self.mappings.read().await;
        Ok(mappings.clone())
    }

    async fn replace_all(&self, new_mappings: Vec<EntityMapping>) -> Result<(), RepositoryError> {
        let mut mappings = self.mappings.write().await;
        *mappings = new_mappings;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLinkRepository {
    links: RwLock<HashMap<String, EventLink>>,
}

#[async_trait::async_trait]
impl LinkRepository for InMemoryLinkRepository {
    async fn find_by_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<EventLink>, RepositoryError> {
        let links = self.links.read().await;
        Ok(links.get(booking_id).cloned())
    }

    async fn save(&self, link: EventLink) -> Result<(), RepositoryError> {
        let mut links = self.links.write().await;
        links.insert(link.booking_id.clone(), link);
        Ok(())
    }

    async fn delete(&self, booking_id: &str) -> Result<bool, RepositoryError> {
        let mut links = self.links.write().await;
        Ok(links.remove(booking_id).is_some())
    }
}

#[derive(Default)]
pub struct InMemorySyncLogRepository {
    entries: RwLock<Vec<SyncLogEntry>>,
}

#[async_trait::async_trait]
impl SyncLogRepository for InMemorySyncLogRepository {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<SyncLogEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut recent: Vec<SyncLogEntry> = entries.clone();
        recent.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        recent.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use clinicsync_core::domain::link::EventLink;
    use clinicsync_core::identity::{EntityKind, EntityMapping};

    use super::{InMemoryLinkRepository, InMemoryMappingRepository};
    use crate::repositories::{LinkRepository, MappingRepository};

    #[tokio::test]
    async fn in_memory_link_repo_round_trip() {
        let repo = InMemoryLinkRepository::default();
        let link = EventLink::new("B1", "evt-1", None);

        repo.save(link.clone()).await.expect("save link");
        assert_eq!(repo.find_by_booking("B1").await.expect("find"), Some(link));
        assert!(repo.delete("B1").await.expect("delete"));
        assert!(!repo.delete("B1").await.expect("delete again"));
    }

    #[tokio::test]
    async fn in_memory_mapping_repo_replaces_wholesale() {
        let repo = InMemoryMappingRepository::default();

        repo.replace_all(vec![EntityMapping::new(EntityKind::Service, "S1").with_calendar("C1")])
            .await
            .expect("seed");
        repo.replace_all(vec![EntityMapping::new(EntityKind::Site, "X1").with_calendar("C2")])
            .await
            .expect("replace");

        let loaded = repo.load_all().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].entity_id, "X1");
    }
}
