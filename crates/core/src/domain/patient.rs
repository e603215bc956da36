use serde::{Deserialize, Serialize};

/// Patient data as carried by booking and contact events.
///
/// `new_email` / `new_phone` are only populated on update events and signal a
/// change of contact channel: the original fields remain the keys used to
/// locate the CRM contact, while the replacements win when building the
/// update payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub fiscal_code: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub new_email: Option<String>,
    #[serde(default)]
    pub new_phone: Option<String>,
}

impl PatientRecord {
    pub fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }

    /// Replacement-or-original semantics for update payloads.
    pub fn effective_email(&self) -> Option<&str> {
        self.new_email.as_deref().or(self.email.as_deref())
    }

    pub fn effective_phone(&self) -> Option<&str> {
        self.new_phone.as_deref().or(self.phone.as_deref())
    }

    /// Best identifier for logs and sync-log rows.
    pub fn match_key(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.phone.clone())
            .or_else(|| self.fiscal_code.clone())
            .unwrap_or_else(|| self.full_name())
    }
}
