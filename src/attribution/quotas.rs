use core::fmt;
use std::fmt::Display;

use serde::Serialize;

use crate::{
    budget::traits::FilterCapacities, config::EngineConfig,
    reports::debug_report::DebugReportType,
};

/// Contribution budgets an aggregatable contribution is charged against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum BudgetId {
    /// Per-source cap on the sum of aggregatable values.
    Source,

    /// A named sub-allocation of the source cap.
    Named(String),
}

impl Display for BudgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetId::Source => write!(f, "Source"),
            BudgetId::Named(name) => write!(f, "Named({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetStatus<BID> {
    /// Every budget had room, the atomic check passed.
    Continue,

    /// At least one budget was out of room. The ids of exhausted budgets are
    /// listed when known.
    OutOfBudget(Vec<BID>),
}

/// Counters bounded by the attribution rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum RateLimitId {
    /// Attributions in the rate-limit window for one (source site,
    /// destination site, enrollment).
    Attributions {
        source_site: String,
        destination_site: String,
        enrollment_id: String,
    },

    /// Distinct reporting origins attributed in the rate-limit window for
    /// one (source site, destination site).
    ReportingOrigins {
        source_site: String,
        destination_site: String,
    },

    /// Pending event reports for one destination.
    EventReports(String),

    /// Pending aggregate reports for one destination.
    AggregateReports(String),
}

impl Display for RateLimitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitId::Attributions {
                source_site,
                destination_site,
                enrollment_id,
            } => write!(
                f,
                "Attributions({source_site}, {destination_site}, {enrollment_id})"
            ),
            RateLimitId::ReportingOrigins {
                source_site,
                destination_site,
            } => write!(f, "ReportingOrigins({source_site}, {destination_site})"),
            RateLimitId::EventReports(destination) => {
                write!(f, "EventReports({destination})")
            }
            RateLimitId::AggregateReports(destination) => {
                write!(f, "AggregateReports({destination})")
            }
        }
    }
}

/// Capacity of each rate-limit counter, read from the engine configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitCapacities {
    pub attributions: u64,
    pub reporting_origins: u64,
    pub event_reports: u64,
    pub aggregate_reports: u64,
}

impl RateLimitCapacities {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attributions: config.max_attributions_per_rate_limit_window as u64,
            reporting_origins: config.max_distinct_reporting_origins_in_attribution as u64,
            event_reports: config.max_event_reports_per_destination as u64,
            aggregate_reports: config.max_aggregate_reports_per_destination as u64,
        }
    }
}

impl FilterCapacities for RateLimitCapacities {
    type FilterId = RateLimitId;
    type Budget = u64;
    type Error = anyhow::Error;

    fn capacity(&self, limit_id: &RateLimitId) -> Result<u64, Self::Error> {
        match limit_id {
            RateLimitId::Attributions { .. } => Ok(self.attributions),
            RateLimitId::ReportingOrigins { .. } => Ok(self.reporting_origins),
            RateLimitId::EventReports(..) => Ok(self.event_reports),
            RateLimitId::AggregateReports(..) => Ok(self.aggregate_reports),
        }
    }
}

/// Why a registration or an attribution was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DenialReason {
    NoMatchingSource,
    NoMatchingFilterData,
    AttributionsPerSourceDestinationLimit,
    ReportingOriginLimit,
    EventStorageLimit,
    AggregateStorageLimit,
    /// Neither builder produced a report; each builder already explained
    /// its own drop.
    NoReportGenerated,
    DestinationLimit,
    DestinationRateLimit,
    EnrollmentDestinationRateLimit,
    SourceReportingOriginLimit,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NoMatchingSource => "trigger-no-matching-source",
            DenialReason::NoMatchingFilterData => "trigger-no-matching-filter-data",
            DenialReason::AttributionsPerSourceDestinationLimit => {
                "trigger-attributions-per-source-destination-limit"
            }
            DenialReason::ReportingOriginLimit => "trigger-reporting-origin-limit",
            DenialReason::EventStorageLimit => "trigger-event-storage-limit",
            DenialReason::AggregateStorageLimit => "trigger-aggregate-storage-limit",
            DenialReason::NoReportGenerated => "trigger-no-report-generated",
            DenialReason::DestinationLimit => "source-destination-limit",
            DenialReason::DestinationRateLimit => "source-destination-rate-limit",
            DenialReason::EnrollmentDestinationRateLimit => {
                "source-destination-per-enrollment-rate-limit"
            }
            DenialReason::SourceReportingOriginLimit => "source-reporting-origin-limit",
        }
    }

    /// Debug report describing the denial, if it has one of its own.
    pub fn debug_report_type(&self) -> Option<DebugReportType> {
        let report_type = match self {
            DenialReason::NoMatchingSource => DebugReportType::TriggerNoMatchingSource,
            DenialReason::NoMatchingFilterData => DebugReportType::TriggerNoMatchingFilterData,
            DenialReason::AttributionsPerSourceDestinationLimit => {
                DebugReportType::TriggerAttributionsPerSourceDestinationLimit
            }
            DenialReason::ReportingOriginLimit => DebugReportType::TriggerReportingOriginLimit,
            DenialReason::EventStorageLimit => DebugReportType::TriggerEventStorageLimit,
            DenialReason::AggregateStorageLimit => DebugReportType::TriggerAggregateStorageLimit,
            DenialReason::NoReportGenerated => return None,
            DenialReason::DestinationLimit => DebugReportType::SourceDestinationLimit,
            DenialReason::DestinationRateLimit | DenialReason::EnrollmentDestinationRateLimit => {
                DebugReportType::SourceDestinationRateLimit
            }
            DenialReason::SourceReportingOriginLimit => DebugReportType::SourceReportingOriginLimit,
        };
        Some(report_type)
    }
}

impl Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
