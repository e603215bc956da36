use serde::{Deserialize, Serialize};

/// Uniform outcome record for one dispatched event.
///
/// The dispatcher never lets an error escape its boundary: every outcome,
/// success or failure, is one of these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_updated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_created: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_updated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_deleted: Option<bool>,
}

impl SyncResult {
    pub fn success(event_type: impl Into<String>) -> Self {
        Self { success: true, event_type: event_type.into(), ..Self::default() }
    }

    pub fn failure(event_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            event_type: event_type.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
