//! Identity resolution between Booking-System entities and CRM identities.
//!
//! The mapping table is administrative data: it is loaded from the store (or
//! seeded from configuration) and replaced wholesale by the admin endpoint.
//! The engine only ever reads it; an entity without a mapping is a hard,
//! non-retryable failure for the event that referenced it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Site,
    Doctor,
    Service,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Doctor => "doctor",
            Self::Service => "service",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "site" => Some(Self::Site),
            "doctor" => Some(Self::Doctor),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persistent association between a Booking-System entity and its CRM
/// counterpart. Composite calendar keys (`{site_id}_{category}`) are stored
/// as site-kind rows whose `entity_id` is the composite key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub kind: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default)]
    pub assigned_user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl EntityMapping {
    pub fn new(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            entity_id: entity_id.into(),
            calendar_id: None,
            assigned_user_id: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_calendar(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
        self
    }

    pub fn with_assigned_user(mut self, user_id: impl Into<String>) -> Self {
        self.assigned_user_id = Some(user_id.into());
        self
    }
}

/// In-memory index the Identity Mapper resolves against.
///
/// Calendar resolution is tiered: exact service id, then exact site id, then
/// the composite `{site_id}_{category}` key. First match wins; tiers are
/// never merged. Assigned users resolve by doctor id only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MappingTable {
    calendars: HashMap<String, String>,
    users: HashMap<String, String>,
}

impl MappingTable {
    pub fn from_mappings(mappings: &[EntityMapping]) -> Self {
        let mut table = Self::default();
        for mapping in mappings {
            if let Some(calendar_id) = &mapping.calendar_id {
                table.calendars.insert(mapping.entity_id.clone(), calendar_id.clone());
            }
            if mapping.kind == EntityKind::Doctor {
                if let Some(user_id) = &mapping.assigned_user_id {
                    table.users.insert(mapping.entity_id.clone(), user_id.clone());
                }
            }
        }
        table
    }

    pub fn resolve_calendar(
        &self,
        service_id: &str,
        site_id: &str,
        category: Option<&str>,
    ) -> Option<String> {
        if let Some(calendar) = self.calendars.get(service_id) {
            return Some(calendar.clone());
        }
        if let Some(calendar) = self.calendars.get(site_id) {
            return Some(calendar.clone());
        }
        let category = category?;
        self.calendars.get(&format!("{site_id}_{category}")).cloned()
    }

    pub fn resolve_assigned_user(&self, doctor_id: &str) -> Option<String> {
        self.users.get(doctor_id).cloned()
    }

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calendars.is_empty() && self.users.is_empty()
    }
}
