//! Calendar-event synchronization: time-window computation, deterministic
//! note building, and create/update/delete against the CRM.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use clinicsync_core::domain::event::{parse_start_time, BookingDetails};
use clinicsync_core::SyncError;

use crate::crm::{AppointmentRequest, AppointmentUpdate, CrmClient};

const APPOINTMENT_STATUS_CONFIRMED: &str = "confirmed";

pub struct AppointmentSynchronizer {
    crm: CrmClient,
}

impl AppointmentSynchronizer {
    pub fn new(crm: CrmClient) -> Self {
        Self { crm }
    }

    pub async fn create(
        &self,
        calendar_id: &str,
        contact_id: &str,
        assigned_user_id: &str,
        details: &BookingDetails,
    ) -> Result<String, SyncError> {
        let (start, end) = event_window(details)?;

        let request = AppointmentRequest {
            calendar_id: calendar_id.to_owned(),
            contact_id: contact_id.to_owned(),
            assigned_user_id: assigned_user_id.to_owned(),
            start_time: format_instant(start),
            end_time: format_instant(end),
            title: details.service.name.clone(),
            appointment_status: APPOINTMENT_STATUS_CONFIRMED.to_owned(),
            ignore_free_slot_validation: true,
            notes: Some(build_notes(details)),
        };

        self.crm.create_appointment(&request).await
    }

    pub async fn update(
        &self,
        event_id: &str,
        details: &BookingDetails,
        calendar_id: Option<String>,
        assigned_user_id: Option<String>,
    ) -> Result<(), SyncError> {
        let (start, end) = event_window(details)?;

        let update = AppointmentUpdate {
            calendar_id,
            assigned_user_id,
            start_time: Some(format_instant(start)),
            end_time: Some(format_instant(end)),
            title: Some(details.service.name.clone()),
            notes: Some(build_notes(details)),
        };

        self.crm.update_appointment(event_id, &update).await
    }

    pub async fn delete(&self, event_id: &str) -> Result<(), SyncError> {
        self.crm.delete_event(event_id).await
    }
}

/// Start parsed from the booking's date-time string; end = start + duration
/// (default 30 minutes).
pub fn event_window(details: &BookingDetails) -> Result<(DateTime<Utc>, DateTime<Utc>), SyncError> {
    details.validate()?;
    let start = parse_start_time(&details.start)?;
    let end = start + Duration::minutes(details.effective_duration_minutes());
    Ok((start, end))
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Human-readable event notes, built deterministically from the booking.
/// Field order is fixed; omitted fields are simply absent lines.
pub fn build_notes(details: &BookingDetails) -> String {
    let mut lines = vec![format!("Booking #{}", details.booking_id)];
    lines.push(format!("Service: {}", details.service.name));
    lines.push(format!(
        "Site: {}",
        details.site.name.as_deref().unwrap_or(details.site.id.as_str())
    ));
    lines.push(format!(
        "Doctor: {}",
        details.doctor.name.as_deref().unwrap_or(details.doctor.id.as_str())
    ));
    if let Some(payment) = &details.payment {
        match payment.status.as_deref() {
            Some(status) => lines.push(format!("Payment: {} ({status})", payment.amount)),
            None => lines.push(format!("Payment: {}", payment.amount)),
        }
    }
    if let Some(note) = &details.note {
        lines.push(format!("Note: {note}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use clinicsync_core::domain::event::{
        BookingDetails, DoctorRef, PaymentSummary, ServiceRef, SiteRef,
    };
    use clinicsync_core::PatientRecord;

    use super::{build_notes, event_window, format_instant};

    fn details() -> BookingDetails {
        BookingDetails {
            booking_id: "B1".to_owned(),
            start: "2025-12-03 14:00".to_owned(),
            duration_minutes: None,
            service: ServiceRef { id: "S1".to_owned(), name: "Checkup".to_owned(), category: None },
            site: SiteRef { id: "X1".to_owned(), name: None },
            doctor: DoctorRef { id: "D1".to_owned(), name: Some("Dr. Bianchi".to_owned()) },
            patient: PatientRecord { first_name: "Ada".to_owned(), ..PatientRecord::default() },
            payment: None,
            note: None,
        }
    }

    #[test]
    fn window_defaults_to_thirty_minutes() {
        let (start, end) = event_window(&details()).expect("window computes");
        assert_eq!(format_instant(start), "2025-12-03T14:00:00.000Z");
        assert_eq!(format_instant(end), "2025-12-03T14:30:00.000Z");
    }

    #[test]
    fn explicit_duration_overrides_the_default() {
        let mut details = details();
        details.duration_minutes = Some(45);

        let (_, end) = event_window(&details).expect("window computes");
        assert_eq!(format_instant(end), "2025-12-03T14:45:00.000Z");
    }

    #[test]
    fn invalid_start_time_fails_the_window() {
        let mut details = details();
        details.start = "tomorrow-ish".to_owned();
        assert!(event_window(&details).is_err());
    }

    #[test]
    fn notes_include_every_present_field_in_fixed_order() {
        let mut details = details();
        details.site.name = Some("Main Clinic".to_owned());
        details.payment =
            Some(PaymentSummary { amount: "45.00".to_owned(), status: Some("paid".to_owned()) });
        details.note = Some("first visit".to_owned());

        assert_eq!(
            build_notes(&details),
            "Booking #B1\n\
             Service: Checkup\n\
             Site: Main Clinic\n\
             Doctor: Dr. Bianchi\n\
             Payment: 45.00 (paid)\n\
             Note: first visit"
        );
    }

    #[test]
    fn notes_omit_absent_fields_without_placeholders() {
        assert_eq!(
            build_notes(&details()),
            "Booking #B1\nService: Checkup\nSite: X1\nDoctor: Dr. Bianchi"
        );
    }
}
