use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::traits::Timestamp;

/// Delivery state of a queued report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportStatus {
    Pending,
    Delivered,
    MarkedToDelete,
}

/// Common view over queued reports, used by the expiry sweep and by the
/// external reporting job.
pub trait Report: Debug + Clone {
    fn report_id(&self) -> &str;

    fn scheduled_report_time(&self) -> Timestamp;

    fn status(&self) -> ReportStatus;

    fn retry_count(&self) -> u32;

    fn increment_retry_count(&mut self);

    /// Semantic content of the report body, as consumed downstream.
    fn payload(&self) -> Value;
}

/// Millisecond timestamps are reported as whole seconds in strings.
pub(crate) fn seconds_string(time: Timestamp) -> String {
    (time / 1000).to_string()
}
