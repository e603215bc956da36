//! Inbound webhook event model.
//!
//! The wire shape is a loose envelope (`event_type` + `data`); it is parsed
//! into the [`BookingEvent`] sum type before any handler runs, so every
//! downstream match over event kinds is exhaustive. An unrecognized
//! `event_type` never constructs an event: it surfaces as a validation
//! failure naming the offending value.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::patient::PatientRecord;
use crate::errors::SyncError;

pub const DEFAULT_DURATION_MINUTES: i64 = 30;

pub const EVENT_BOOKING_CREATED: &str = "booking.created";
pub const EVENT_BOOKING_UPDATED: &str = "booking.updated";
pub const EVENT_BOOKING_CANCELLED: &str = "booking.cancelled";
pub const EVENT_CONTACT_CREATED: &str = "contact.created";
pub const EVENT_CONTACT_UPDATED: &str = "contact.updated";

/// Raw inbound notification, prior to typed parsing.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub amount: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingDetails {
    #[serde(alias = "id")]
    pub booking_id: String,
    pub start: String,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    pub service: ServiceRef,
    pub site: SiteRef,
    pub doctor: DoctorRef,
    pub patient: PatientRecord,
    #[serde(default)]
    pub payment: Option<PaymentSummary>,
    #[serde(default)]
    pub note: Option<String>,
}

impl BookingDetails {
    pub fn effective_duration_minutes(&self) -> i64 {
        self.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        parse_start_time(&self.start)?;
        if let Some(duration) = self.duration_minutes {
            if duration <= 0 {
                return Err(SyncError::Validation(format!(
                    "duration must be positive, got {duration}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingCancellation {
    #[serde(alias = "id")]
    pub booking_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Typed event, one variant per recognized `event_type`.
#[derive(Clone, Debug, PartialEq)]
pub enum BookingEvent {
    BookingCreated(BookingDetails),
    BookingUpdated(BookingDetails),
    BookingCancelled(BookingCancellation),
    ContactCreated(PatientRecord),
    ContactUpdated(PatientRecord),
}

impl BookingEvent {
    pub fn parse(envelope: &WebhookEnvelope) -> Result<Self, SyncError> {
        let data = envelope.data.clone();
        match envelope.event_type.as_str() {
            EVENT_BOOKING_CREATED => decode(data).map(Self::BookingCreated),
            EVENT_BOOKING_UPDATED => decode(data).map(Self::BookingUpdated),
            EVENT_BOOKING_CANCELLED => decode(data).map(Self::BookingCancelled),
            EVENT_CONTACT_CREATED => decode(data).map(Self::ContactCreated),
            EVENT_CONTACT_UPDATED => decode(data).map(Self::ContactUpdated),
            other => {
                Err(SyncError::Validation(format!("unrecognized event type `{other}`")))
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BookingCreated(_) => EVENT_BOOKING_CREATED,
            Self::BookingUpdated(_) => EVENT_BOOKING_UPDATED,
            Self::BookingCancelled(_) => EVENT_BOOKING_CANCELLED,
            Self::ContactCreated(_) => EVENT_CONTACT_CREATED,
            Self::ContactUpdated(_) => EVENT_CONTACT_UPDATED,
        }
    }

    /// The identifier logged and written into sync-log rows.
    pub fn entity_id(&self) -> String {
        match self {
            Self::BookingCreated(details) | Self::BookingUpdated(details) => {
                details.booking_id.clone()
            }
            Self::BookingCancelled(cancellation) => cancellation.booking_id.clone(),
            Self::ContactCreated(patient) | Self::ContactUpdated(patient) => patient.match_key(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data)
        .map_err(|error| SyncError::Validation(format!("invalid event payload: {error}")))
}

/// Parse a booking start time into a UTC instant.
///
/// The Booking System emits naive local-less timestamps (`2025-12-03 14:00`);
/// RFC 3339 inputs are accepted as well.
pub fn parse_start_time(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(SyncError::Validation(format!("unparseable start time `{raw}`")))
}
