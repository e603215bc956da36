use thiserror::Error;

use crate::identity::EntityKind;

/// The two upstream platforms every outbound call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternalService {
    BookingSystem,
    Crm,
}

impl ExternalService {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookingSystem => "booking-system",
            Self::Crm => "crm",
        }
    }
}

impl std::fmt::Display for ExternalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy for one sync attempt.
///
/// Every external call is classified exactly once at the client boundary;
/// the resilience wrapper only consults [`SyncError::retryable`] and never
/// re-inspects transport details.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("{service} request failed: {message}")]
    Network { service: ExternalService, status: Option<u16>, message: String, retryable: bool },
    #[error("{service} rate limited")]
    RateLimit { service: ExternalService, retry_after_secs: Option<u64> },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no {kind} mapping configured for `{id}`")]
    Mapping { kind: EntityKind, id: String },
    #[error("{0}")]
    Business(String),
    #[error("circuit breaker open for {service}")]
    CircuitOpen { service: ExternalService },
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SyncError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::RateLimit { .. } => true,
            _ => false,
        }
    }

    /// Stable class label used in logs and sync-log rows.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::RateLimit { .. } => "rate_limit",
            Self::Validation(_) => "validation",
            Self::Mapping { .. } => "mapping",
            Self::Business(_) => "business",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Persistence(_) => "persistence",
        }
    }
}
