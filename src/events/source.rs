use serde::{Deserialize, Serialize};

use super::{
    aggregation::AggregationKeys,
    bounded::BoundedDedupKeys,
    filters::FilterMap,
    traits::{
        site_of, AttributionMode, DestinationLimitAlgorithm, EventSurfaceType, Registration,
        SourceStatus, SourceType, Timestamp,
    },
    trigger_specs::{ReportConfig, TriggerDataMatching},
};
use crate::budget::{contribution_filter::ContributionFilter, named_budgets::AggregatableNamedBudgets};

/// Attribution scopes declared by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionScopes {
    pub scopes: Vec<String>,
    pub limit: u64,
    pub max_event_states: u64,
}

/// Privacy parameters computed once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyParameters {
    pub num_states: u64,
    pub flip_probability: f64,
    pub information_gain: f64,
}

/// A stored impression or click registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// Carried as unsigned even though reporting treats it as opaque 64 bits.
    pub event_id: u64,
    pub publisher: String,
    pub publisher_type: EventSurfaceType,
    pub app_destinations: Vec<String>,
    pub web_destinations: Vec<String>,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub source_type: SourceType,
    pub priority: i64,
    pub event_time: Timestamp,
    pub expiry_time: Timestamp,
    pub aggregatable_report_window: Timestamp,
    pub status: SourceStatus,
    pub attribution_mode: AttributionMode,
    pub event_report_dedup_keys: BoundedDedupKeys,
    pub aggregate_report_dedup_keys: BoundedDedupKeys,
    pub report_config: ReportConfig,
    pub trigger_data_matching: TriggerDataMatching,
    pub attribution_scopes: Option<AttributionScopes>,
    pub filter_data: FilterMap,
    pub shared_filter_data_keys: Option<Vec<String>>,
    pub aggregation_keys: AggregationKeys,
    pub shared_aggregation_keys: Vec<String>,
    pub aggregate_contributions: ContributionFilter,
    pub named_budgets: Option<AggregatableNamedBudgets>,
    pub debug_key: Option<u64>,
    pub debug_reporting: bool,
    pub event_level_epsilon: Option<f64>,
    pub destination_limit_algorithm: DestinationLimitAlgorithm,
    pub privacy_parameters: Option<PrivacyParameters>,
    /// Source this one was derived from, if any.
    pub parent_id: Option<String>,
}

impl Source {
    /// Destinations of the given surface.
    pub fn destinations(&self, surface: EventSurfaceType) -> &[String] {
        match surface {
            EventSurfaceType::App => &self.app_destinations,
            EventSurfaceType::Web => &self.web_destinations,
        }
    }

    pub fn all_destinations(&self) -> impl Iterator<Item = &String> {
        self.app_destinations.iter().chain(self.web_destinations.iter())
    }

    /// Web destinations match on site.
    pub fn has_destination(&self, destination: &str, surface: EventSurfaceType) -> bool {
        match surface {
            EventSurfaceType::App => self.app_destinations.iter().any(|d| d == destination),
            EventSurfaceType::Web => {
                let site = site_of(destination);
                self.web_destinations.iter().any(|d| site_of(d) == site)
            }
        }
    }

    /// True when the source reports to both an app and a web destination.
    pub fn is_dual_destination(&self) -> bool {
        !self.app_destinations.is_empty() && !self.web_destinations.is_empty()
    }

    /// Factor applied to report windows by the number of destination
    /// surfaces a report could be attributed on.
    pub fn destination_multiplier(&self) -> usize {
        if self.is_dual_destination() {
            2
        } else {
            1
        }
    }

    /// Filter data as seen by trigger filters.
    pub fn effective_filter_data(&self) -> FilterMap {
        self.filter_data.with_source_type(self.source_type)
    }

    /// Copy of this source registered on behalf of another ad-tech. Only the
    /// shared aggregation keys and shared filter-data keys carry over, and
    /// the copy starts with fresh dedup and budget state.
    pub fn derive_for(
        &self,
        id: impl Into<String>,
        enrollment_id: impl Into<String>,
        registration_origin: impl Into<String>,
    ) -> Source {
        let aggregation_keys = self
            .aggregation_keys
            .iter()
            .filter(|(key, _)| self.shared_aggregation_keys.contains(key))
            .map(|(key, piece)| (key.clone(), *piece))
            .collect();
        let filter_data = match &self.shared_filter_data_keys {
            Some(keys) => self.filter_data.retain_keys(keys),
            None => FilterMap::new(),
        };
        Source {
            id: id.into(),
            enrollment_id: enrollment_id.into(),
            registration_origin: registration_origin.into(),
            aggregation_keys,
            filter_data,
            parent_id: Some(self.id.clone()),
            attribution_mode: AttributionMode::Unassigned,
            event_report_dedup_keys: BoundedDedupKeys::new(
                self.event_report_dedup_keys.capacity(),
            ),
            aggregate_report_dedup_keys: BoundedDedupKeys::new(
                self.aggregate_report_dedup_keys.capacity(),
            ),
            aggregate_contributions: ContributionFilter {
                consumed: 0,
                capacity: self.aggregate_contributions.capacity,
            },
            named_budgets: self.named_budgets.as_ref().map(|b| b.reset()),
            report_config: self.report_config.reset(),
            ..self.clone()
        }
    }

    pub fn flip_probability(&self) -> f64 {
        self.privacy_parameters
            .map_or(0.0, |params| params.flip_probability)
    }

    pub fn is_active_at(&self, time: Timestamp) -> bool {
        self.status == SourceStatus::Active && self.event_time <= time && time < self.expiry_time
    }
}

impl Registration for Source {
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
        self.event_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_source_keeps_shared_keys_only() {
        let mut source = Source::mock();
        source.aggregation_keys.insert("shared".to_string(), 0x1);
        source.aggregation_keys.insert("private".to_string(), 0x2);
        source.shared_aggregation_keys = vec!["shared".to_string()];
        source.filter_data.insert("product", vec!["1".to_string()]);
        source.filter_data.insert("secret", vec!["2".to_string()]);
        source.shared_filter_data_keys = Some(vec!["product".to_string()]);
        source.event_report_dedup_keys.insert(7);

        let derived = source.derive_for("derived", "enrollment-2", "https://other.test");
        assert_eq!(derived.parent_id.as_deref(), Some(source.id.as_str()));
        assert_eq!(derived.aggregation_keys.len(), 1);
        assert!(derived.aggregation_keys.contains_key("shared"));
        assert!(derived.filter_data.get("secret").is_none());
        assert!(derived.event_report_dedup_keys.is_empty());
        assert_eq!(derived.attribution_mode, AttributionMode::Unassigned);
    }
}
