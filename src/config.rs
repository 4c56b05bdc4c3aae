use serde::{Deserialize, Serialize};

use crate::{
    error::MeasurementError,
    events::traits::{SourceType, Timestamp, ONE_DAY_MS, ONE_HOUR_MS},
};

/// Numeric ceilings and feature toggles driving registration, privacy
/// accounting and attribution. One instance is handed to every component at
/// construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Privacy parameters.
    pub default_event_level_epsilon: f64,
    pub max_event_level_epsilon: f64,
    pub max_report_states_per_source: u64,
    pub event_info_gain_threshold: f64,
    pub navigation_info_gain_threshold: f64,
    pub event_dual_destination_info_gain_threshold: f64,
    pub navigation_dual_destination_info_gain_threshold: f64,
    pub event_scopes_info_gain_threshold: f64,
    pub navigation_scopes_info_gain_threshold: f64,
    pub default_max_event_states: u64,

    // Legacy event-level defaults.
    pub event_trigger_data_cardinality: u64,
    pub navigation_trigger_data_cardinality: u64,
    pub event_max_reports: u32,
    pub navigation_max_reports: u32,
    pub navigation_early_report_windows: Vec<Timestamp>,
    pub event_report_delay: Timestamp,

    // Registration bounds.
    pub min_source_expiry: Timestamp,
    pub max_source_expiry: Timestamp,
    pub min_event_report_window: Timestamp,
    pub max_event_level_reports: u32,
    pub max_trigger_data_cardinality: usize,
    pub max_report_windows_per_spec: usize,
    pub max_aggregation_keys_per_source: usize,
    pub max_named_budgets_per_source: usize,
    pub max_attribution_scopes_per_source: usize,
    pub max_attribution_scope_length: usize,
    pub max_filter_maps_per_filter_set: usize,

    // Aggregate reports.
    pub max_sum_of_aggregate_values_per_source: u64,
    pub max_aggregate_reports_per_source: usize,
    pub min_aggregate_report_delay: Timestamp,
    pub max_aggregate_report_delay: Timestamp,
    pub aggregate_api_version: String,
    pub default_aggregation_coordinator_origin: String,

    // Attribution rate limits.
    pub rate_limit_window: Timestamp,
    pub max_attributions_per_rate_limit_window: usize,
    pub max_distinct_reporting_origins_in_attribution: usize,
    pub max_event_reports_per_destination: usize,
    pub max_aggregate_reports_per_destination: usize,

    // Source registration rate limits.
    pub max_distinct_destinations_in_active_source: usize,
    pub destination_rate_limit_window: Timestamp,
    pub max_destinations_per_publisher_per_rate_limit_window: usize,
    /// Same window, counting only the registering enrollment's sources.
    pub max_destinations_per_publisher_x_enrollment_per_rate_limit_window: usize,
    pub max_distinct_reporting_origins_per_publisher_destination: usize,

    // Batch processing.
    pub max_attributions_per_invocation: usize,

    // Feature toggles.
    pub enable_lookback_window_filter: bool,
    pub enable_attribution_scopes: bool,
    pub enable_named_budgets: bool,
    pub enable_x_network: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_event_level_epsilon: 14.0,
            max_event_level_epsilon: 14.0,
            max_report_states_per_source: (1u64 << 32) - 1,
            event_info_gain_threshold: 6.5,
            navigation_info_gain_threshold: 11.46173,
            event_dual_destination_info_gain_threshold: 6.5,
            navigation_dual_destination_info_gain_threshold: 11.46173,
            event_scopes_info_gain_threshold: 6.5,
            navigation_scopes_info_gain_threshold: 11.55,
            default_max_event_states: 3,

            event_trigger_data_cardinality: 2,
            navigation_trigger_data_cardinality: 8,
            event_max_reports: 1,
            navigation_max_reports: 3,
            navigation_early_report_windows: vec![2 * ONE_DAY_MS, 7 * ONE_DAY_MS],
            event_report_delay: ONE_HOUR_MS,

            min_source_expiry: ONE_DAY_MS,
            max_source_expiry: 30 * ONE_DAY_MS,
            min_event_report_window: ONE_HOUR_MS,
            max_event_level_reports: 20,
            max_trigger_data_cardinality: 32,
            max_report_windows_per_spec: 5,
            max_aggregation_keys_per_source: 20,
            max_named_budgets_per_source: 25,
            max_attribution_scopes_per_source: 20,
            max_attribution_scope_length: 50,
            max_filter_maps_per_filter_set: 20,

            max_sum_of_aggregate_values_per_source: 65536,
            max_aggregate_reports_per_source: 20,
            min_aggregate_report_delay: 10 * 60 * 1000,
            max_aggregate_report_delay: 60 * 60 * 1000,
            aggregate_api_version: "0.1".to_string(),
            default_aggregation_coordinator_origin:
                "https://publickeyservice.aws.privacysandboxservices.com"
                    .to_string(),

            rate_limit_window: 30 * ONE_DAY_MS,
            max_attributions_per_rate_limit_window: 100,
            max_distinct_reporting_origins_in_attribution: 10,
            max_event_reports_per_destination: 1024,
            max_aggregate_reports_per_destination: 1024,

            max_distinct_destinations_in_active_source: 100,
            destination_rate_limit_window: 60 * 1000,
            max_destinations_per_publisher_per_rate_limit_window: 50,
            max_destinations_per_publisher_x_enrollment_per_rate_limit_window: 50,
            max_distinct_reporting_origins_per_publisher_destination: 100,

            max_attributions_per_invocation: 100,

            enable_lookback_window_filter: true,
            enable_attribution_scopes: true,
            enable_named_budgets: true,
            enable_x_network: true,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, MeasurementError> {
        let config: Self = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    /// Rejects configurations that would make registration or noise
    /// undefined.
    pub fn check(&self) -> Result<(), MeasurementError> {
        if self.min_source_expiry > self.max_source_expiry {
            return Err(MeasurementError::InvalidConfiguration(
                "min_source_expiry exceeds max_source_expiry".to_string(),
            ));
        }
        if self.min_aggregate_report_delay > self.max_aggregate_report_delay {
            return Err(MeasurementError::InvalidConfiguration(
                "min_aggregate_report_delay exceeds max_aggregate_report_delay"
                    .to_string(),
            ));
        }
        if !(self.default_event_level_epsilon >= 0.0
            && self.default_event_level_epsilon <= self.max_event_level_epsilon)
        {
            return Err(MeasurementError::InvalidConfiguration(format!(
                "default epsilon {} outside [0, {}]",
                self.default_event_level_epsilon, self.max_event_level_epsilon
            )));
        }
        Ok(())
    }

    pub fn default_trigger_data_cardinality(&self, source_type: SourceType) -> u64 {
        match source_type {
            SourceType::Event => self.event_trigger_data_cardinality,
            SourceType::Navigation => self.navigation_trigger_data_cardinality,
        }
    }

    pub fn default_max_reports(&self, source_type: SourceType) -> u32 {
        match source_type {
            SourceType::Event => self.event_max_reports,
            SourceType::Navigation => self.navigation_max_reports,
        }
    }

    /// Early report window ends (relative to source time) used when a
    /// registration does not configure its own windows.
    pub fn default_early_report_windows(&self, source_type: SourceType) -> &[Timestamp] {
        match source_type {
            SourceType::Event => &[],
            SourceType::Navigation => &self.navigation_early_report_windows,
        }
    }

    /// Information gain ceiling for a source, in bits.
    pub fn info_gain_threshold(
        &self,
        source_type: SourceType,
        dual_destination: bool,
        scopes_enabled: bool,
    ) -> f64 {
        match (source_type, scopes_enabled, dual_destination) {
            (SourceType::Event, true, _) => self.event_scopes_info_gain_threshold,
            (SourceType::Navigation, true, _) => {
                self.navigation_scopes_info_gain_threshold
            }
            (SourceType::Event, false, false) => self.event_info_gain_threshold,
            (SourceType::Event, false, true) => {
                self.event_dual_destination_info_gain_threshold
            }
            (SourceType::Navigation, false, false) => {
                self.navigation_info_gain_threshold
            }
            (SourceType::Navigation, false, true) => {
                self.navigation_dual_destination_info_gain_threshold
            }
        }
    }
}
