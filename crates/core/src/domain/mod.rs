pub mod event;
pub mod link;
pub mod patient;
pub mod result;
pub mod sync_log;
