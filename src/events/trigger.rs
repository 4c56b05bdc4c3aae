use serde::{Deserialize, Serialize};

use super::{
    aggregation::{
        AggregatableTriggerData, AggregatableValuesConfig, AggregateDeduplicationKey,
        NamedBudgetSelector,
    },
    filters::FilterSet,
    traits::{EventSurfaceType, Registration, Timestamp, TriggerStatus},
};

/// One entry of a trigger's `event_trigger_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub trigger_data: u64,
    pub priority: i64,
    pub dedup_key: Option<u64>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
    /// Summed by `value_sum` trigger specs; `count` specs use 1.
    pub value: u64,
}

/// A conversion registration awaiting attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub attribution_destination: String,
    pub destination_type: EventSurfaceType,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub trigger_time: Timestamp,
    pub status: TriggerStatus,
    pub event_triggers: Vec<EventTrigger>,
    pub aggregatable_trigger_data: Vec<AggregatableTriggerData>,
    pub aggregatable_values: Vec<AggregatableValuesConfig>,
    pub aggregatable_dedup_keys: Vec<AggregateDeduplicationKey>,
    pub named_budgets: Vec<NamedBudgetSelector>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
    pub attribution_scopes: Vec<String>,
    pub debug_key: Option<u64>,
    pub debug_reporting: bool,
    pub aggregation_coordinator_origin: Option<String>,
}

impl Trigger {
    pub fn is_pending(&self) -> bool {
        self.status == TriggerStatus::Pending
    }

    pub fn has_aggregatable_data(&self) -> bool {
        !self.aggregatable_trigger_data.is_empty() || !self.aggregatable_values.is_empty()
    }
}

impl Registration for Trigger {
    fn registration_id(&self) -> &str {
        &self.id
    }

    fn enrollment_id(&self) -> &str {
        &self.enrollment_id
    }

    fn registration_origin(&self) -> &str {
        &self.registration_origin
    }

    fn registration_time(&self) -> Timestamp {
        self.trigger_time
    }
}
