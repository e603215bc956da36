pub mod config;
pub mod domain;
pub mod errors;
pub mod identity;
pub mod signing;

pub use chrono;

pub use domain::event::{
    BookingCancellation, BookingDetails, BookingEvent, DoctorRef, PaymentSummary, ServiceRef,
    SiteRef, WebhookEnvelope,
};
pub use domain::link::EventLink;
pub use domain::patient::PatientRecord;
pub use domain::result::SyncResult;
pub use domain::sync_log::{SyncAction, SyncLogEntry, SyncStatus};
pub use errors::{ExternalService, SyncError};
pub use identity::{EntityKind, EntityMapping, MappingTable};
