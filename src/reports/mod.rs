pub mod aggregate_report;
pub mod debug_report;
pub mod event_report;
pub mod traits;
