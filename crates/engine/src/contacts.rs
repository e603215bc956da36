//! Contact deduplication against the CRM.
//!
//! Matching is strict and short-circuiting: email exact match, then phone,
//! then fiscal code (a custom field). A failed fiscal-code search degrades
//! to "not found" because not every CRM instance carries the field. New
//! contacts are tagged with their provenance, and fiscal code / birth date /
//! notes are mirrored into custom fields since the CRM has no native
//! equivalents.

use tracing::{info, warn};

use clinicsync_core::{PatientRecord, SyncError};

use crate::crm::{ContactUpdate, CrmClient, CrmContact, CustomFieldValue, NewContact};

pub const PROVENANCE_SOURCE: &str = "clinic-booking-sync";
pub const PROVENANCE_TAG: &str = "clinic-booking";

/// Custom-field search path for the fiscal code.
pub const FISCAL_CODE_FIELD: &str = "customFields.fiscal_code";

const FISCAL_CODE_KEY: &str = "fiscal_code";
const BIRTH_DATE_KEY: &str = "birth_date";
const PATIENT_NOTES_KEY: &str = "patient_notes";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactOutcome {
    pub contact_id: String,
    pub created: bool,
}

pub struct ContactReconciler {
    crm: CrmClient,
}

impl ContactReconciler {
    pub fn new(crm: CrmClient) -> Self {
        Self { crm }
    }

    /// Resolve the patient to a CRM contact, creating one when no matching
    /// key resolves.
    pub async fn resolve_or_create(
        &self,
        patient: &PatientRecord,
    ) -> Result<ContactOutcome, SyncError> {
        if let Some(existing) = self.find_existing(patient).await? {
            info!(
                event_name = "contacts.match.found",
                contact_id = %existing.id,
                "matched existing contact"
            );
            return Ok(ContactOutcome { contact_id: existing.id, created: false });
        }

        let contact_id = self.crm.create_contact(&build_new_contact(patient)).await?;
        info!(event_name = "contacts.created", contact_id = %contact_id, "created new contact");
        Ok(ContactOutcome { contact_id, created: true })
    }

    /// Locate an existing contact via the full matching order without ever
    /// creating one. Each step is a single remote search.
    pub async fn find_existing(
        &self,
        patient: &PatientRecord,
    ) -> Result<Option<CrmContact>, SyncError> {
        if let Some(email) = patient.email.as_deref() {
            if let Some(contact) = self.crm.search_contact("email", email).await? {
                return Ok(Some(contact));
            }
        }

        if let Some(phone) = patient.phone.as_deref() {
            if let Some(contact) = self.crm.search_contact("phone", phone).await? {
                return Ok(Some(contact));
            }
        }

        if let Some(fiscal_code) = patient.fiscal_code.as_deref() {
            match self.crm.search_contact(FISCAL_CODE_FIELD, fiscal_code).await {
                Ok(Some(contact)) => return Ok(Some(contact)),
                Ok(None) => {}
                Err(error) => {
                    // The custom field may not exist on this CRM instance.
                    warn!(
                        event_name = "contacts.fiscal_search.degraded",
                        error = %error,
                        "fiscal-code search failed, treating as not found"
                    );
                }
            }
        }

        Ok(None)
    }

    pub async fn apply_update(
        &self,
        contact_id: &str,
        patient: &PatientRecord,
    ) -> Result<(), SyncError> {
        self.crm.update_contact(contact_id, &build_contact_update(patient)).await
    }
}

pub fn build_new_contact(patient: &PatientRecord) -> NewContact {
    NewContact {
        first_name: patient.first_name.clone(),
        last_name: patient.last_name.clone(),
        email: patient.effective_email().map(str::to_owned),
        phone: patient.effective_phone().map(str::to_owned),
        address1: patient.address.clone(),
        city: patient.city.clone(),
        postal_code: patient.postal_code.clone(),
        source: PROVENANCE_SOURCE.to_owned(),
        tags: vec![PROVENANCE_TAG.to_owned()],
        custom_fields: custom_fields(patient),
    }
}

/// Update payload with replacement-or-original semantics per field.
pub fn build_contact_update(patient: &PatientRecord) -> ContactUpdate {
    ContactUpdate {
        first_name: Some(patient.first_name.clone()),
        last_name: Some(patient.last_name.clone()),
        email: patient.effective_email().map(str::to_owned),
        phone: patient.effective_phone().map(str::to_owned),
        address1: patient.address.clone(),
        city: patient.city.clone(),
        postal_code: patient.postal_code.clone(),
        custom_fields: custom_fields(patient),
    }
}

fn custom_fields(patient: &PatientRecord) -> Vec<CustomFieldValue> {
    let mut fields = Vec::new();
    if let Some(fiscal_code) = &patient.fiscal_code {
        fields.push(CustomFieldValue {
            key: FISCAL_CODE_KEY.to_owned(),
            field_value: fiscal_code.clone(),
        });
    }
    if let Some(birth_date) = &patient.birth_date {
        fields.push(CustomFieldValue {
            key: BIRTH_DATE_KEY.to_owned(),
            field_value: birth_date.clone(),
        });
    }
    if let Some(note) = &patient.note {
        fields.push(CustomFieldValue {
            key: PATIENT_NOTES_KEY.to_owned(),
            field_value: note.clone(),
        });
    }
    fields
}

#[cfg(test)]
mod tests {
    use clinicsync_core::PatientRecord;

    use super::{build_contact_update, build_new_contact, PROVENANCE_SOURCE, PROVENANCE_TAG};

    fn patient() -> PatientRecord {
        PatientRecord {
            first_name: "Ada".to_owned(),
            last_name: "Rossi".to_owned(),
            email: Some("ada@example.com".to_owned()),
            phone: Some("+390001".to_owned()),
            fiscal_code: Some("RSSDAA80A41H501X".to_owned()),
            birth_date: Some("1980-01-01".to_owned()),
            note: Some("allergic to penicillin".to_owned()),
            ..PatientRecord::default()
        }
    }

    #[test]
    fn new_contacts_carry_provenance_and_mirrored_custom_fields() {
        let contact = build_new_contact(&patient());

        assert_eq!(contact.source, PROVENANCE_SOURCE);
        assert_eq!(contact.tags, vec![PROVENANCE_TAG.to_owned()]);

        let keys: Vec<&str> =
            contact.custom_fields.iter().map(|field| field.key.as_str()).collect();
        assert_eq!(keys, vec!["fiscal_code", "birth_date", "patient_notes"]);
    }

    #[test]
    fn update_payload_prefers_replacement_contact_channels() {
        let mut patient = patient();
        patient.new_email = Some("ada.new@example.com".to_owned());
        patient.new_phone = Some("+390002".to_owned());

        let update = build_contact_update(&patient);
        assert_eq!(update.email.as_deref(), Some("ada.new@example.com"));
        assert_eq!(update.phone.as_deref(), Some("+390002"));
    }

    #[test]
    fn update_payload_keeps_originals_without_replacements() {
        let update = build_contact_update(&patient());
        assert_eq!(update.email.as_deref(), Some("ada@example.com"));
        assert_eq!(update.phone.as_deref(), Some("+390001"));
    }
}
