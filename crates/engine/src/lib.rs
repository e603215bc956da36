//! Reconciliation engine between the Booking System and the CRM.
//!
//! This crate owns everything between an authenticated webhook envelope and
//! the CRM mutations it implies:
//! - **Resilience** (`resilience`) - retry with jittered backoff around a
//!   per-service circuit breaker; every outbound call goes through both
//! - **Clients** (`booking_system`, `crm`) - thin REST clients that classify
//!   failures exactly once at the boundary
//! - **Contact Reconciler** (`contacts`) - email → phone → fiscal-code
//!   matching with graceful degradation, find-or-create semantics
//! - **Appointment Synchronizer** (`appointments`) - calendar-event CRUD,
//!   time-window computation, deterministic note building
//! - **Dispatcher** (`sync`) - the five-state event machine producing a
//!   uniform [`clinicsync_core::SyncResult`] for every inbound event
//!
//! # Architecture
//!
//! ```text
//! Webhook → SyncService → Identity Mapper + Contact Reconciler
//!                       → Appointment Synchronizer
//!                       → retry(circuit_breaker(CRM call))
//! ```

pub mod appointments;
pub mod booking_system;
pub mod contacts;
pub mod crm;
pub mod resilience;
pub mod sync;

pub use appointments::AppointmentSynchronizer;
pub use booking_system::BookingSystemClient;
pub use contacts::{ContactOutcome, ContactReconciler};
pub use crm::CrmClient;
pub use resilience::{with_retry, CircuitBreaker, CircuitState, RetryOptions};
pub use sync::SyncService;
