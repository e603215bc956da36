use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use clinicsync_db::DbPool;
use clinicsync_engine::{BookingSystemClient, CrmClient};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone)]
pub struct StatusState {
    db_pool: DbPool,
    booking_client: BookingSystemClient,
    crm_client: CrmClient,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub checked_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpstreamCheck {
    pub status: &'static str,
    pub circuit: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub booking_system: UpstreamCheck,
    pub crm: UpstreamCheck,
    pub checked_at: String,
}

pub fn router(
    db_pool: DbPool,
    booking_client: BookingSystemClient,
    crm_client: CrmClient,
) -> Router {
    let health = Router::new()
        .route("/health", get(health))
        .with_state(HealthState { db_pool: db_pool.clone() });
    let status = Router::new()
        .route("/status", get(status))
        .with_state(StatusState { db_pool, booking_client, crm_client });
    health.merge(status)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "clinicsync-server runtime initialized".to_string(),
        },
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

/// Component status: database plus a live probe of both upstream APIs and
/// their circuit breakers.
pub async fn status(State(state): State<StatusState>) -> (StatusCode, Json<StatusResponse>) {
    let database = database_check(&state.db_pool).await;

    let booking_healthy = state.booking_client.check_health().await;
    let crm_healthy = state.crm_client.check_health().await;
    if !booking_healthy || !crm_healthy {
        warn!(
            event_name = "system.status.upstream_degraded",
            booking_system = booking_healthy,
            crm = crm_healthy,
            "upstream health probe failed"
        );
    }

    let booking_system = UpstreamCheck {
        status: if booking_healthy { "ready" } else { "degraded" },
        circuit: state.booking_client.breaker_state().as_str(),
    };
    let crm = UpstreamCheck {
        status: if crm_healthy { "ready" } else { "degraded" },
        circuit: state.crm_client.breaker_state().as_str(),
    };

    let ready = database.status == "ready" && booking_healthy && crm_healthy;
    let payload = StatusResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        booking_system,
        crm,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
