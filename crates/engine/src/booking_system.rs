//! Clinic-booking REST client: basic auth, JSON envelope responses,
//! paginated list endpoints fetched concurrently, and batch-add endpoints
//! capped at a fixed item count per call (chunked client-side).

use std::sync::Arc;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;

use clinicsync_core::config::{BookingApiConfig, SyncConfig};
use clinicsync_core::domain::event::BookingDetails;
use clinicsync_core::{ExternalService, SyncError};

use crate::crm::{classify_http_failure, transport_error};
use crate::resilience::{with_retry, CircuitBreaker, CircuitState, RetryOptions};

const SERVICE: ExternalService = ExternalService::BookingSystem;

/// Uniform Booking System response envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// One doctor-unavailability block pushed into the Booking System agenda.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnavailabilityBlock {
    pub id: String,
    pub doctor_id: String,
    pub site_id: String,
    pub start_date: String,
    pub start_time: String,
    pub end_date: String,
    pub end_time: String,
}

#[derive(Clone)]
pub struct BookingSystemClient {
    http: Client,
    base_url: String,
    company_code: String,
    api_key: SecretString,
    batch_chunk_size: usize,
    retry: RetryOptions,
    breaker: Arc<CircuitBreaker>,
}

impl BookingSystemClient {
    pub fn new(
        http: Client,
        config: &BookingApiConfig,
        sync: &SyncConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            company_code: config.company_code.clone(),
            api_key: config.api_key.clone(),
            batch_chunk_size: sync.batch_chunk_size.max(1),
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

    /// Fetch every booking, batching any remaining pages as concurrent
    /// independent requests once the first page reveals the page count.
    pub async fn list_bookings(
        &self,
        status: Option<&str>,
    ) -> Result<Vec<BookingDetails>, SyncError> {
        let base_path = match status {
            Some(status) => format!("/bookings?status={status}"),
            None => "/bookings".to_owned(),
        };

        let first: ApiEnvelope<Vec<BookingDetails>> =
            self.request(Method::GET, &base_path, None).await?;
        let mut bookings = first.data.unwrap_or_default();

        let Some(paging) = first.paging else {
            return Ok(bookings);
        };
        let (Some(page), Some(total_pages)) = (paging.page, paging.total_pages) else {
            return Ok(bookings);
        };
        if total_pages <= page {
            return Ok(bookings);
        }

        let separator = if base_path.contains('?') { '&' } else { '?' };
        let mut pages = JoinSet::new();
        for page_number in (page + 1)..=total_pages {
            let client = self.clone();
            let path = format!("{base_path}{separator}page={page_number}");
            pages.spawn(async move {
                let envelope: Result<ApiEnvelope<Vec<BookingDetails>>, SyncError> =
                    client.request(Method::GET, &path, None).await;
                (page_number, envelope)
            });
        }

        let mut fetched: Vec<(u32, Vec<BookingDetails>)> = Vec::new();
        while let Some(joined) = pages.join_next().await {
            let (page_number, envelope) = joined.map_err(|error| SyncError::Network {
                service: SERVICE,
                status: None,
                message: format!("page fetch task failed: {error}"),
                retryable: false,
            })?;
            fetched.push((page_number, envelope?.data.unwrap_or_default()));
        }

        fetched.sort_by_key(|(page_number, _)| *page_number);
        for (_, mut page_data) in fetched {
            bookings.append(&mut page_data);
        }

        Ok(bookings)
    }

    pub async fn list_sites(&self) -> Result<Vec<Site>, SyncError> {
        let envelope: ApiEnvelope<Vec<Site>> = self.request(Method::GET, "/sites/", None).await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Batch-add unavailability blocks. The endpoint caps the item count per
    /// call, so the input is chunked client-side; one receipt per chunk.
    pub async fn add_unavailability(
        &self,
        blocks: &[UnavailabilityBlock],
    ) -> Result<Vec<String>, SyncError> {
        let mut receipts = Vec::new();
        for chunk in blocks.chunks(self.batch_chunk_size) {
            let body = serde_json::json!({ "blocks": chunk });
            let envelope: ApiEnvelope<String> =
                self.request(Method::POST, "/unavailability/add", Some(body)).await?;
            if let Some(receipt) = envelope.data {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }

    pub async fn check_health(&self) -> bool {
        match self.list_sites().await {
            Ok(_) => true,
            Err(error) => {
                warn!(
                    event_name = "booking_system.health.failed",
                    error = %error,
                    "booking system health probe failed"
                );
                false
            }
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiEnvelope<T>, SyncError> {
        let context = format!("booking-system {method} {path}");
        with_retry(&self.retry, &context, || {
            self.breaker.execute(&context, || self.send(method.clone(), path, body.clone()))
        })
        .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiEnvelope<T>, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.company_code, Some(self.api_key.expose_secret()))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| transport_error(SERVICE, &error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_failure(SERVICE, status, response).await);
        }

        let envelope: ApiEnvelope<T> =
            response.json().await.map_err(|error| SyncError::Network {
                service: SERVICE,
                status: None,
                message: format!("undecodable response body: {error}"),
                retryable: false,
            })?;

        if !envelope.success {
            return Err(SyncError::Network {
                service: SERVICE,
                status: Some(StatusCode::OK.as_u16()),
                message: envelope
                    .error
                    .and_then(|error| error.message)
                    .unwrap_or_else(|| "API returned success: false".to_owned()),
                retryable: false,
            });
        }

        Ok(envelope)
    }
}
