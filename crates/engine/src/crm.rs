//! CRM REST client: bearer-token auth, versioned via a `Version` header,
//! contact search/create/update, calendar-event CRUD, users/calendars lists.
//!
//! Failures are classified exactly once here (transport and 5xx retryable,
//! 429 rate-limited, everything else terminal); callers and the resilience
//! wrapper only look at the classification.

use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use clinicsync_core::config::{CrmApiConfig, SyncConfig};
use clinicsync_core::{ExternalService, SyncError};

use crate::resilience::{with_retry, CircuitBreaker, CircuitState, RetryOptions};

const SERVICE: ExternalService = ExternalService::Crm;

/// CRM-owned contact identity. The engine reads it and requests mutations;
/// it never caches contact state beyond a single reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmContact {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFieldValue {
    pub key: String,
    pub field_value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    pub source: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields: Vec<CustomFieldValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields: Vec<CustomFieldValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentRequest {
    pub calendar_id: String,
    pub contact_id: String,
    pub assigned_user_id: String,
    pub start_time: String,
    pub end_time: String,
    pub title: String,
    pub appointment_status: String,
    pub ignore_free_slot_validation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmCalendar {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContactSearchResponse {
    #[serde(default)]
    contacts: Vec<CrmContact>,
}

#[derive(Debug, Deserialize)]
struct CreateContactResponse {
    contact: CrmContact,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarsResponse {
    #[serde(default)]
    calendars: Vec<CrmCalendar>,
}

#[derive(Debug, Default, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<CrmUser>,
}

#[derive(Clone)]
pub struct CrmClient {
    http: Client,
    base_url: String,
    api_token: SecretString,
    location_id: String,
    api_version: String,
    retry: RetryOptions,
    breaker: Arc<CircuitBreaker>,
}

impl CrmClient {
    pub fn new(
        http: Client,
        config: &CrmApiConfig,
        sync: &SyncConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_token: config.api_token.clone(),
            location_id: config.location_id.clone(),
            api_version: config.api_version.clone(),
            retry: RetryOptions {
                max_retries: sync.max_retries,
                base_delay_ms: sync.base_delay_ms,
                max_delay_ms: sync.max_delay_ms,
                exponential_base: sync.backoff_base,
                jitter: true,
            },
            breaker,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Search one contact by an exact filter match. The filter field may be
    /// a native field (`email`, `phone`) or a custom-field path.
    pub async fn search_contact(
        &self,
        field: &str,
        value: &str,
    ) -> Result<Option<CrmContact>, SyncError> {
        let body = json!({
            "locationId": self.location_id,
            "page": 1,
            "pageLimit": 1,
            "filters": [
                { "field": field, "operator": "eq", "value": value }
            ]
        });

        let response: ContactSearchResponse =
            self.request(Method::POST, "/contacts/search", Some(body)).await?;
        Ok(response.contacts.into_iter().next())
    }

    pub async fn create_contact(&self, contact: &NewContact) -> Result<String, SyncError> {
        let mut body = serde_json::to_value(contact)
            .map_err(|error| SyncError::Validation(format!("unencodable contact: {error}")))?;
        body["locationId"] = json!(self.location_id);

        let response: CreateContactResponse =
            self.request(Method::POST, "/contacts/", Some(body)).await?;
        Ok(response.contact.id)
    }

    pub async fn update_contact(
        &self,
        contact_id: &str,
        update: &ContactUpdate,
    ) -> Result<(), SyncError> {
        let body = serde_json::to_value(update)
            .map_err(|error| SyncError::Validation(format!("unencodable contact: {error}")))?;
        let path = format!("/contacts/{contact_id}");
        self.request_no_content(Method::PUT, &path, Some(body)).await
    }

    pub async fn create_appointment(
        &self,
        request: &AppointmentRequest,
    ) -> Result<String, SyncError> {
        let mut body = serde_json::to_value(request)
            .map_err(|error| SyncError::Validation(format!("unencodable appointment: {error}")))?;
        body["locationId"] = json!(self.location_id);

        let response: EventResponse =
            self.request(Method::POST, "/calendars/events/appointments", Some(body)).await?;
        Ok(response.id)
    }

    pub async fn update_appointment(
        &self,
        event_id: &str,
        update: &AppointmentUpdate,
    ) -> Result<(), SyncError> {
        let body = serde_json::to_value(update)
            .map_err(|error| SyncError::Validation(format!("unencodable appointment: {error}")))?;
        let path = format!("/calendars/events/{event_id}");
        self.request_no_content(Method::PUT, &path, Some(body)).await
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<(), SyncError> {
        let path = format!("/calendars/events/{event_id}");
        self.request_no_content(Method::DELETE, &path, None).await
    }

    pub async fn list_calendars(&self) -> Result<Vec<CrmCalendar>, SyncError> {
        let path = format!("/calendars?locationId={}", self.location_id);
        let response: CalendarsResponse = self.request(Method::GET, &path, None).await?;
        Ok(response.calendars)
    }

    pub async fn list_users(&self) -> Result<Vec<CrmUser>, SyncError> {
        let path = format!("/users?locationId={}", self.location_id);
        let response: UsersResponse = self.request(Method::GET, &path, None).await?;
        Ok(response.users)
    }

    pub async fn check_health(&self) -> bool {
        self.list_calendars().await.is_ok()
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, SyncError> {
        let context = format!("crm {method} {path}");
        with_retry(&self.retry, &context, || {
            self.breaker.execute(&context, || self.send_json(method.clone(), path, body.clone()))
        })
        .await
    }

    async fn request_no_content(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(), SyncError> {
        let context = format!("crm {method} {path}");
        with_retry(&self.retry, &context, || {
            self.breaker.execute(&context, || self.send_unit(method.clone(), path, body.clone()))
        })
        .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, SyncError> {
        let response = self.send(method, path, body).await?;
        decode_json(response).await
    }

    async fn send_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(), SyncError> {
        self.send(method, path, body).await.map(|_| ())
    }

    /// One raw HTTP exchange; classifies every failure.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.api_token.expose_secret())
            .header("Version", &self.api_version)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| transport_error(SERVICE, &error))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(classify_http_failure(SERVICE, status, response).await)
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    response.json::<T>().await.map_err(|error| SyncError::Network {
        service: SERVICE,
        status: None,
        message: format!("undecodable response body: {error}"),
        retryable: false,
    })
}

pub(crate) fn transport_error(service: ExternalService, error: &reqwest::Error) -> SyncError {
    SyncError::Network { service, status: None, message: error.to_string(), retryable: true }
}

/// Classify a non-success HTTP status exactly once: 429 is rate limiting,
/// 5xx is retryable, anything else is terminal.
pub(crate) async fn classify_http_failure(
    service: ExternalService,
    status: StatusCode,
    response: Response,
) -> SyncError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        return SyncError::RateLimit { service, retry_after_secs };
    }

    SyncError::Network {
        service,
        status: Some(status.as_u16()),
        message: error_message(response).await.unwrap_or_else(|| format!("HTTP {status} error")),
        retryable: status.is_server_error(),
    }
}

async fn error_message(response: Response) -> Option<String> {
    let raw = response.text().await.ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(Value::as_str) {
                return Some(message.to_owned());
            }
        }
    }
    Some(raw)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AppointmentRequest, ContactUpdate, CustomFieldValue, NewContact};

    #[test]
    fn new_contact_serializes_to_the_crm_wire_shape() {
        let contact = NewContact {
            first_name: "Ada".to_owned(),
            last_name: "Rossi".to_owned(),
            email: Some("a@b.com".to_owned()),
            phone: None,
            source: "clinic-booking-sync".to_owned(),
            tags: vec!["clinic-booking".to_owned()],
            custom_fields: vec![CustomFieldValue {
                key: "fiscal_code".to_owned(),
                field_value: "RSSDAA80A41H501X".to_owned(),
            }],
            ..NewContact::default()
        };

        let value = serde_json::to_value(&contact).expect("serializes");
        assert_eq!(value["firstName"], "Ada");
        assert_eq!(value["email"], "a@b.com");
        assert!(value.get("phone").is_none());
        assert_eq!(value["customFields"][0]["fieldValue"], "RSSDAA80A41H501X");
    }

    #[test]
    fn empty_update_serializes_to_an_empty_object() {
        let value = serde_json::to_value(ContactUpdate::default()).expect("serializes");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn appointment_request_carries_status_and_slot_override() {
        let request = AppointmentRequest {
            calendar_id: "C1".to_owned(),
            contact_id: "K1".to_owned(),
            assigned_user_id: "U1".to_owned(),
            start_time: "2025-12-03T14:00:00.000Z".to_owned(),
            end_time: "2025-12-03T14:30:00.000Z".to_owned(),
            title: "Checkup".to_owned(),
            appointment_status: "confirmed".to_owned(),
            ignore_free_slot_validation: true,
            notes: None,
        };

        let value = serde_json::to_value(&request).expect("serializes");
        assert_eq!(value["appointmentStatus"], "confirmed");
        assert_eq!(value["ignoreFreeSlotValidation"], true);
        assert_eq!(value["startTime"], "2025-12-03T14:00:00.000Z");
    }
}
