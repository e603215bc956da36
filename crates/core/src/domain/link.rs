use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correspondence between a booking id and the CRM calendar event it
/// produced. This is the sole idempotency key preventing duplicate calendar
/// events for the same booking: created when `booking.created` succeeds,
/// consulted on update/cancel, removed on cancel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLink {
    pub booking_id: String,
    pub event_id: String,
    pub calendar_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventLink {
    pub fn new(
        booking_id: impl Into<String>,
        event_id: impl Into<String>,
        calendar_id: Option<String>,
    ) -> Self {
        Self {
            booking_id: booking_id.into(),
            event_id: event_id.into(),
            calendar_id,
            created_at: Utc::now(),
        }
    }
}
