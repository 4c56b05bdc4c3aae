use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::traits::{Report, ReportStatus};
use crate::events::{
    source::Source,
    traits::{site_of, Registration, Timestamp},
    trigger::Trigger,
};

/// Verbose debug report types, named after the attribution-reporting
/// vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugReportType {
    SourceSuccess,
    SourceNoised,
    SourceDestinationLimit,
    SourceDestinationRateLimit,
    SourceReportingOriginLimit,
    SourceChannelCapacityLimit,
    SourceScopesChannelCapacityLimit,
    SourceMaxEventStatesLimit,
    SourceUnknownError,
    TriggerNoMatchingSource,
    TriggerNoMatchingFilterData,
    TriggerAttributionsPerSourceDestinationLimit,
    TriggerReportingOriginLimit,
    TriggerEventStorageLimit,
    TriggerAggregateStorageLimit,
    TriggerEventDeduplicated,
    TriggerEventNoMatchingConfigurations,
    TriggerEventNoMatchingTriggerData,
    TriggerEventReportWindowPassed,
    TriggerEventExcessiveReports,
    TriggerEventLowPriority,
    TriggerEventNoise,
    TriggerAggregateDeduplicated,
    TriggerAggregateNoContributions,
    TriggerAggregateReportWindowPassed,
    TriggerAggregateExcessiveReports,
    TriggerAggregateInsufficientBudget,
    TriggerAggregateInsufficientNamedBudget,
}

impl DebugReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugReportType::SourceSuccess => "source-success",
            DebugReportType::SourceNoised => "source-noised",
            DebugReportType::SourceDestinationLimit => "source-destination-limit",
            DebugReportType::SourceDestinationRateLimit => "source-destination-rate-limit",
            DebugReportType::SourceReportingOriginLimit => "source-reporting-origin-limit",
            DebugReportType::SourceChannelCapacityLimit => "source-channel-capacity-limit",
            DebugReportType::SourceScopesChannelCapacityLimit => {
                "source-scopes-channel-capacity-limit"
            }
            DebugReportType::SourceMaxEventStatesLimit => "source-max-event-states-limit",
            DebugReportType::SourceUnknownError => "source-unknown-error",
            DebugReportType::TriggerNoMatchingSource => "trigger-no-matching-source",
            DebugReportType::TriggerNoMatchingFilterData => "trigger-no-matching-filter-data",
            DebugReportType::TriggerAttributionsPerSourceDestinationLimit => {
                "trigger-attributions-per-source-destination-limit"
            }
            DebugReportType::TriggerReportingOriginLimit => "trigger-reporting-origin-limit",
            DebugReportType::TriggerEventStorageLimit => "trigger-event-storage-limit",
            DebugReportType::TriggerAggregateStorageLimit => "trigger-aggregate-storage-limit",
            DebugReportType::TriggerEventDeduplicated => "trigger-event-deduplicated",
            DebugReportType::TriggerEventNoMatchingConfigurations => {
                "trigger-event-no-matching-configurations"
            }
            DebugReportType::TriggerEventNoMatchingTriggerData => {
                "trigger-event-no-matching-trigger-data"
            }
            DebugReportType::TriggerEventReportWindowPassed => "trigger-event-report-window-passed",
            DebugReportType::TriggerEventExcessiveReports => "trigger-event-excessive-reports",
            DebugReportType::TriggerEventLowPriority => "trigger-event-low-priority",
            DebugReportType::TriggerEventNoise => "trigger-event-noise",
            DebugReportType::TriggerAggregateDeduplicated => "trigger-aggregate-deduplicated",
            DebugReportType::TriggerAggregateNoContributions => "trigger-aggregate-no-contributions",
            DebugReportType::TriggerAggregateReportWindowPassed => {
                "trigger-aggregate-report-window-passed"
            }
            DebugReportType::TriggerAggregateExcessiveReports => {
                "trigger-aggregate-excessive-reports"
            }
            DebugReportType::TriggerAggregateInsufficientBudget => {
                "trigger-aggregate-insufficient-budget"
            }
            DebugReportType::TriggerAggregateInsufficientNamedBudget => {
                "trigger-aggregate-insufficient-named-budget"
            }
        }
    }
}

/// A verbose debug report, queued only when the registration opted in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugReport {
    /// Assigned by the datastore on insert.
    pub id: String,
    pub report_type: DebugReportType,
    pub body: Value,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub insertion_time: Timestamp,
    pub status: ReportStatus,
    pub retry_count: u32,
}

impl DebugReport {
    fn new<R: Registration>(
        report_type: DebugReportType,
        body: Map<String, Value>,
        registration: &R,
    ) -> Self {
        Self {
            id: String::new(),
            report_type,
            body: Value::Object(body),
            enrollment_id: registration.enrollment_id().to_string(),
            registration_origin: registration.registration_origin().to_string(),
            insertion_time: registration.registration_time(),
            status: ReportStatus::Pending,
            retry_count: 0,
        }
    }

    /// Report about a source registration, or `None` if the source did not
    /// opt in.
    pub fn for_source(
        source: &Source,
        report_type: DebugReportType,
        limit: Option<String>,
    ) -> Option<Self> {
        if !source.debug_reporting {
            return None;
        }
        let mut body = source_fields(source);
        if let Some(limit) = limit {
            body.insert("limit".to_string(), json!(limit));
        }
        Some(Self::new(report_type, body, source))
    }

    /// Report about an attribution attempt, or `None` if the trigger did not
    /// opt in. The matched source, if any, contributes its identifiers.
    pub fn for_trigger(
        source: Option<&Source>,
        trigger: &Trigger,
        report_type: DebugReportType,
        limit: Option<String>,
    ) -> Option<Self> {
        if !trigger.debug_reporting {
            return None;
        }
        let mut body = match source {
            Some(source) => source_fields(source),
            None => Map::new(),
        };
        body.insert(
            "attribution_destination".to_string(),
            json!(trigger.attribution_destination),
        );
        if let Some(key) = trigger.debug_key {
            body.insert("trigger_debug_key".to_string(), json!(key.to_string()));
        }
        if let Some(limit) = limit {
            body.insert("limit".to_string(), json!(limit));
        }
        Some(Self::new(report_type, body, trigger))
    }
}

fn source_fields(source: &Source) -> Map<String, Value> {
    let destinations: Vec<&String> = source.all_destinations().collect();
    let mut body = Map::new();
    body.insert("attribution_destination".to_string(), json!(destinations));
    body.insert(
        "source_event_id".to_string(),
        json!(source.event_id.to_string()),
    );
    body.insert("source_site".to_string(), json!(site_of(&source.publisher)));
    if let Some(key) = source.debug_key {
        body.insert("source_debug_key".to_string(), json!(key.to_string()));
    }
    body
}

impl Report for DebugReport {
    fn report_id(&self) -> &str {
        &self.id
    }

    fn scheduled_report_time(&self) -> Timestamp {
        self.insertion_time
    }

    fn status(&self) -> ReportStatus {
        self.status
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn increment_retry_count(&mut self) {
        self.retry_count += 1;
    }

    fn payload(&self) -> Value {
        json!([{ "type": self.report_type.as_str(), "body": self.body }])
    }
}
