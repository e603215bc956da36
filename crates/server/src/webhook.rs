//! Inbound webhook surface: the booking-event endpoint plus the mapping
//! inspection/replacement endpoints.
//!
//! Response contract: 200 for a recognized success, 422 for a recognized but
//! failed sync (upstream may choose to redeliver), 401 for authentication
//! failures, 400 for malformed payloads.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use clinicsync_core::domain::event::WebhookEnvelope;
use clinicsync_core::{EntityMapping, MappingTable};
use clinicsync_db::repositories::MappingRepository;
use clinicsync_engine::SyncService;

use crate::auth;

#[derive(Clone)]
pub struct WebhookState {
    pub sync_service: Arc<SyncService>,
    pub mappings: Arc<RwLock<MappingTable>>,
    pub mapping_repo: Arc<dyn MappingRepository>,
    pub secret: SecretString,
    pub tolerance_ms: i64,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/bookings", post(receive_booking_event))
        .route("/webhook/mapping", get(show_mapping).put(replace_mapping))
        .with_state(state)
}

async fn receive_booking_event(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(auth_error) =
        auth::verify_webhook(&headers, &body, &state.secret, state.tolerance_ms)
    {
        warn!(
            event_name = "webhook.auth.rejected",
            error = %auth_error,
            "webhook authentication failed"
        );
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": auth_error.to_string() })))
            .into_response();
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(parse_error) => {
            warn!(
                event_name = "webhook.payload.unparseable",
                error = %parse_error,
                "webhook body is not valid JSON"
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": format!("invalid JSON payload: {parse_error}")
                })),
            )
                .into_response();
        }
    };

    if envelope.event_type.trim().is_empty() || envelope.data.is_null() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Invalid payload: missing event_type or data"
            })),
        )
            .into_response();
    }

    let started = Instant::now();
    let result = state.sync_service.handle(&envelope).await;
    info!(
        event_name = "webhook.processed",
        event_type = %envelope.event_type,
        success = result.success,
        duration_ms = started.elapsed().as_millis() as u64,
        "webhook processed"
    );

    let status =
        if result.success { StatusCode::OK } else { StatusCode::UNPROCESSABLE_ENTITY };
    (status, Json(result)).into_response()
}

#[derive(Serialize)]
struct MappingOverview {
    calendars: usize,
    doctors: usize,
    mappings: Vec<EntityMapping>,
}

async fn show_mapping(State(state): State<WebhookState>) -> Response {
    let rows = match state.mapping_repo.load_all().await {
        Ok(rows) => rows,
        Err(repo_error) => {
            error!(
                event_name = "webhook.mapping.load_failed",
                error = %repo_error,
                "could not load entity mappings"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "could not load mappings" })),
            )
                .into_response();
        }
    };

    let (calendars, doctors) = {
        let table = read_table(&state.mappings);
        (table.calendar_count(), table.user_count())
    };

    (StatusCode::OK, Json(MappingOverview { calendars, doctors, mappings: rows })).into_response()
}

#[derive(Deserialize)]
struct ReplaceMappingRequest {
    mappings: Vec<EntityMapping>,
}

/// Wholesale replacement, no partial merge: the submitted table becomes the
/// entire table, in the store and in memory.
async fn replace_mapping(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(auth_error) =
        auth::verify_webhook(&headers, &body, &state.secret, state.tolerance_ms)
    {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": auth_error.to_string() })))
            .into_response();
    }

    let request: ReplaceMappingRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(parse_error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid mapping payload: {parse_error}") })),
            )
                .into_response();
        }
    };

    if request.mappings.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid mapping: no entries" })),
        )
            .into_response();
    }

    if let Err(repo_error) = state.mapping_repo.replace_all(request.mappings.clone()).await {
        error!(
            event_name = "webhook.mapping.replace_failed",
            error = %repo_error,
            "could not persist entity mappings"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "could not persist mappings" })),
        )
            .into_response();
    }

    let table = MappingTable::from_mappings(&request.mappings);
    let (calendars, doctors) = (table.calendar_count(), table.user_count());
    {
        let mut guard = match state.mappings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = table;
    }

    info!(
        event_name = "webhook.mapping.replaced",
        calendars,
        doctors,
        entries = request.mappings.len(),
        "entity mapping table replaced"
    );

    (StatusCode::OK, Json(json!({ "success": true, "message": "Mapping updated" })))
        .into_response()
}

fn read_table(mappings: &RwLock<MappingTable>) -> MappingTable {
    match mappings.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
