//! Webhook dispatcher and event state machine.
//!
//! Five terminal states, one handler each. Every outcome is a
//! [`SyncResult`]; no error, classified or not, escapes [`SyncService::handle`].
//! Operations on the same booking id are serialized through a keyed async
//! mutex so concurrent update/cancel deliveries cannot race on the link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use clinicsync_core::domain::event::{
    BookingCancellation, BookingDetails, BookingEvent, WebhookEnvelope, EVENT_BOOKING_CANCELLED,
    EVENT_BOOKING_CREATED, EVENT_BOOKING_UPDATED, EVENT_CONTACT_CREATED, EVENT_CONTACT_UPDATED,
};
use clinicsync_core::{
    EntityKind, EventLink, MappingTable, PatientRecord, SyncAction, SyncError, SyncLogEntry,
    SyncResult, SyncStatus,
};
use clinicsync_db::repositories::{LinkRepository, RepositoryError, SyncLogRepository};

use crate::appointments::AppointmentSynchronizer;
use crate::contacts::ContactReconciler;
use crate::crm::CrmClient;

/// Async mutex per key; serializes link read-modify-write per booking id.
#[derive(Default)]
pub struct KeyedLock {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLock {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // TODO: evict entries for bookings that are long past.
            locks.entry(key.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct ResolvedIdentity {
    calendar_id: String,
    assigned_user_id: String,
}

pub struct SyncService {
    contacts: ContactReconciler,
    appointments: AppointmentSynchronizer,
    mappings: Arc<RwLock<MappingTable>>,
    links: Arc<dyn LinkRepository>,
    sync_log: Arc<dyn SyncLogRepository>,
    booking_locks: KeyedLock,
}

impl SyncService {
    pub fn new(
        crm: CrmClient,
        mappings: Arc<RwLock<MappingTable>>,
        links: Arc<dyn LinkRepository>,
        sync_log: Arc<dyn SyncLogRepository>,
    ) -> Self {
        Self {
            contacts: ContactReconciler::new(crm.clone()),
            appointments: AppointmentSynchronizer::new(crm),
            mappings,
            links,
            sync_log,
            booking_locks: KeyedLock::default(),
        }
    }

    /// Dispatch one inbound envelope. Always returns a result, never panics
    /// or propagates an error past this boundary.
    pub async fn handle(&self, envelope: &WebhookEnvelope) -> SyncResult {
        let started = Instant::now();

        let event = match BookingEvent::parse(envelope) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    event_name = "sync.event.rejected",
                    event_type = %envelope.event_type,
                    error = %error,
                    "inbound event could not be parsed"
                );
                let event_type = if envelope.event_type.is_empty() {
                    "unknown"
                } else {
                    envelope.event_type.as_str()
                };
                let result = SyncResult::failure(event_type, error.to_string());
                self.record(event_type, "unknown", SyncAction::Sync, &result, started).await;
                return result;
            }
        };

        let event_type = event.event_type();
        let entity_id = event.entity_id();
        info!(
            event_name = "sync.event.received",
            event_type,
            entity_id = %entity_id,
            "processing inbound event"
        );

        let outcome = match &event {
            BookingEvent::BookingCreated(details) => self.handle_booking_created(details).await,
            BookingEvent::BookingUpdated(details) => self.handle_booking_updated(details).await,
            BookingEvent::BookingCancelled(cancellation) => {
                self.handle_booking_cancelled(cancellation).await
            }
            BookingEvent::ContactCreated(patient) => self.handle_contact_created(patient).await,
            BookingEvent::ContactUpdated(patient) => self.handle_contact_updated(patient).await,
        };

        let result = outcome.unwrap_or_else(|error| {
            warn!(
                event_name = "sync.event.failed",
                event_type,
                entity_id = %entity_id,
                error_class = error.class(),
                error = %error,
                "event handling failed"
            );
            SyncResult::failure(event_type, error.to_string())
        });

        self.record(event_type, &entity_id, action_for(&event), &result, started).await;
        result
    }

    async fn handle_booking_created(
        &self,
        details: &BookingDetails,
    ) -> Result<SyncResult, SyncError> {
        details.validate()?;
        let _guard = self.booking_locks.acquire(&details.booking_id).await;
        self.create_flow(details, EVENT_BOOKING_CREATED).await
    }

    async fn handle_booking_updated(
        &self,
        details: &BookingDetails,
    ) -> Result<SyncResult, SyncError> {
        details.validate()?;
        let _guard = self.booking_locks.acquire(&details.booking_id).await;

        let Some(link) = self.find_link(&details.booking_id).await? else {
            // Self-healing for a missed or failed create: fall back to the
            // full creation flow instead of failing the update.
            info!(
                event_name = "sync.booking_updated.fallback_create",
                booking_id = %details.booking_id,
                "no link for updated booking, creating from scratch"
            );
            return self.create_flow(details, EVENT_BOOKING_UPDATED).await;
        };

        let identity = self.resolve_identities(details)?;
        let contact = self.contacts.resolve_or_create(&details.patient).await?;
        self.appointments
            .update(
                &link.event_id,
                details,
                Some(identity.calendar_id),
                Some(identity.assigned_user_id),
            )
            .await?;

        Ok(SyncResult {
            contact_id: Some(contact.contact_id),
            event_id: Some(link.event_id),
            contact_created: Some(contact.created),
            event_updated: Some(true),
            ..SyncResult::success(EVENT_BOOKING_UPDATED)
        })
    }

    async fn handle_booking_cancelled(
        &self,
        cancellation: &BookingCancellation,
    ) -> Result<SyncResult, SyncError> {
        let _guard = self.booking_locks.acquire(&cancellation.booking_id).await;

        let Some(link) = self.find_link(&cancellation.booking_id).await? else {
            // Cancelling something never synced is a no-op, not a failure.
            info!(
                event_name = "sync.booking_cancelled.no_link",
                booking_id = %cancellation.booking_id,
                "no link for cancelled booking, nothing to delete"
            );
            return Ok(SyncResult {
                event_deleted: Some(false),
                ..SyncResult::success(EVENT_BOOKING_CANCELLED)
            });
        };

        self.appointments.delete(&link.event_id).await?;
        self.links
            .delete(&cancellation.booking_id)
            .await
            .map_err(persistence_error)?;

        Ok(SyncResult {
            event_id: Some(link.event_id),
            event_deleted: Some(true),
            ..SyncResult::success(EVENT_BOOKING_CANCELLED)
        })
    }

    async fn handle_contact_created(
        &self,
        patient: &PatientRecord,
    ) -> Result<SyncResult, SyncError> {
        let contact = self.contacts.resolve_or_create(patient).await?;
        Ok(SyncResult {
            contact_id: Some(contact.contact_id),
            contact_created: Some(contact.created),
            ..SyncResult::success(EVENT_CONTACT_CREATED)
        })
    }

    async fn handle_contact_updated(
        &self,
        patient: &PatientRecord,
    ) -> Result<SyncResult, SyncError> {
        match self.contacts.find_existing(patient).await? {
            Some(existing) => {
                self.contacts.apply_update(&existing.id, patient).await?;
                Ok(SyncResult {
                    contact_id: Some(existing.id),
                    contact_created: Some(false),
                    contact_updated: Some(true),
                    ..SyncResult::success(EVENT_CONTACT_UPDATED)
                })
            }
            None => {
                let contact = self.contacts.resolve_or_create(patient).await?;
                Ok(SyncResult {
                    contact_id: Some(contact.contact_id),
                    contact_created: Some(contact.created),
                    ..SyncResult::success(EVENT_CONTACT_UPDATED)
                })
            }
        }
    }

    /// Full creation: duplicate-delivery check, identity resolution, contact
    /// reconciliation, event creation, link persistence. Caller must hold
    /// the per-booking lock.
    async fn create_flow(
        &self,
        details: &BookingDetails,
        event_type: &str,
    ) -> Result<SyncResult, SyncError> {
        if let Some(link) = self.find_link(&details.booking_id).await? {
            info!(
                event_name = "sync.booking_created.duplicate_delivery",
                booking_id = %details.booking_id,
                event_id = %link.event_id,
                "link already exists, treating as already created"
            );
            return Ok(SyncResult {
                event_id: Some(link.event_id),
                event_created: Some(false),
                ..SyncResult::success(event_type)
            });
        }

        let identity = self.resolve_identities(details)?;
        let contact = self.contacts.resolve_or_create(&details.patient).await?;
        let event_id = self
            .appointments
            .create(&identity.calendar_id, &contact.contact_id, &identity.assigned_user_id, details)
            .await?;

        self.links
            .save(EventLink::new(&details.booking_id, &event_id, Some(identity.calendar_id)))
            .await
            .map_err(persistence_error)?;

        info!(
            event_name = "sync.booking_created.completed",
            booking_id = %details.booking_id,
            event_id = %event_id,
            contact_id = %contact.contact_id,
            contact_created = contact.created,
            "booking synced to calendar event"
        );

        Ok(SyncResult {
            contact_id: Some(contact.contact_id),
            event_id: Some(event_id),
            contact_created: Some(contact.created),
            event_created: Some(true),
            ..SyncResult::success(event_type)
        })
    }

    fn resolve_identities(&self, details: &BookingDetails) -> Result<ResolvedIdentity, SyncError> {
        let table = match self.mappings.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let calendar_id = table
            .resolve_calendar(
                &details.service.id,
                &details.site.id,
                details.service.category.as_deref(),
            )
            .ok_or_else(|| SyncError::Mapping {
                kind: EntityKind::Service,
                id: details.service.id.clone(),
            })?;

        let assigned_user_id =
            table.resolve_assigned_user(&details.doctor.id).ok_or_else(|| SyncError::Mapping {
                kind: EntityKind::Doctor,
                id: details.doctor.id.clone(),
            })?;

        Ok(ResolvedIdentity { calendar_id, assigned_user_id })
    }

    async fn find_link(&self, booking_id: &str) -> Result<Option<EventLink>, SyncError> {
        self.links.find_by_booking(booking_id).await.map_err(persistence_error)
    }

    async fn record(
        &self,
        event_type: &str,
        entity_id: &str,
        action: SyncAction,
        result: &SyncResult,
        started: Instant,
    ) {
        let status = if result.success { SyncStatus::Success } else { SyncStatus::Error };
        let entry = SyncLogEntry::record(
            event_type,
            entity_id,
            action,
            status,
            result.error.clone(),
            i64::try_from(started.elapsed().as_millis()).ok(),
        );

        if let Err(error) = self.sync_log.append(entry).await {
            warn!(
                event_name = "sync.log.append_failed",
                error = %error,
                "could not persist sync log entry"
            );
        }
    }
}

fn action_for(event: &BookingEvent) -> SyncAction {
    match event {
        BookingEvent::BookingCreated(_) | BookingEvent::ContactCreated(_) => SyncAction::Create,
        BookingEvent::BookingUpdated(_) | BookingEvent::ContactUpdated(_) => SyncAction::Update,
        BookingEvent::BookingCancelled(_) => SyncAction::Delete,
    }
}

fn persistence_error(error: RepositoryError) -> SyncError {
    SyncError::Persistence(error.to_string())
}
