//! Registration payload parsers. Payloads arrive already fetched and
//! header-decoded; these functions turn them into validated [`Source`] and
//! [`Trigger`] records.

use log::debug;
use serde_json::{Map, Value};

use super::{
    aggregation::{
        optional_filter_set, parse_aggregatable_values, parse_aggregation_keys,
        AggregatableTriggerData, AggregateDeduplicationKey, NamedBudgetSelector,
    },
    bounded::BoundedDedupKeys,
    filters::FilterMap,
    source::{AttributionScopes, Source},
    traits::{
        AttributionMode, DestinationLimitAlgorithm, EventSurfaceType, SourceStatus,
        SourceType, Timestamp, TriggerStatus, ONE_DAY_MS,
    },
    trigger::{EventTrigger, Trigger},
    trigger_specs::{
        LegacyReportConfig, ReportConfig, ReportWindows, TriggerDataMatching, TriggerSpecs,
    },
};
use crate::{
    budget::{contribution_filter::ContributionFilter, named_budgets::AggregatableNamedBudgets},
    config::EngineConfig,
    error::MeasurementError,
};

const MAX_WEB_DESTINATIONS: usize = 3;

/// Reads an unsigned 64-bit value, given either as a JSON number or as a
/// decimal string.
pub(crate) fn json_u64(value: &Value, field: &str) -> Result<u64, MeasurementError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| MeasurementError::Parse(format!("{field} must be an unsigned 64-bit value")))
}

pub(crate) fn json_i64(value: &Value, field: &str) -> Result<i64, MeasurementError> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| MeasurementError::Parse(format!("{field} must be a signed 64-bit value")))
}

/// Reads a duration in seconds and returns it in milliseconds.
pub(crate) fn json_seconds(value: &Value, field: &str) -> Result<Timestamp, MeasurementError> {
    Ok(json_u64(value, field)?.saturating_mul(1000))
}

fn json_bool(object: &Map<String, Value>, field: &str) -> Result<bool, MeasurementError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(MeasurementError::Parse(format!("{field} must be a boolean"))),
    }
}

fn json_string_list(value: &Value, field: &str) -> Result<Vec<String>, MeasurementError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    MeasurementError::Parse(format!("{field} entries must be strings"))
                })
            })
            .collect(),
        _ => Err(MeasurementError::Parse(format!(
            "{field} must be a string or a list of strings"
        ))),
    }
}

fn parse_object(json: &str) -> Result<Map<String, Value>, MeasurementError> {
    match serde_json::from_str(json)? {
        Value::Object(object) => Ok(object),
        _ => Err(MeasurementError::Parse(
            "registration must be a JSON object".to_string(),
        )),
    }
}

/// Everything known about a source registration besides its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRegistrationContext {
    pub source_id: String,
    pub publisher: String,
    pub publisher_type: EventSurfaceType,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub source_type: SourceType,
    pub event_time: Timestamp,
}

/// Everything known about a trigger registration besides its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRegistrationContext {
    pub trigger_id: String,
    pub destination: String,
    pub destination_type: EventSurfaceType,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub trigger_time: Timestamp,
}

/// Parses and validates a source registration payload. Privacy limits are
/// checked separately at admission time.
pub fn parse_source(
    json: &str,
    ctx: &SourceRegistrationContext,
    config: &EngineConfig,
) -> Result<Source, MeasurementError> {
    let object = parse_object(json)?;

    let app_destinations = match object.get("destination") {
        Some(v) => json_string_list(v, "destination")?,
        None => vec![],
    };
    if app_destinations.len() > 1 {
        return Err(MeasurementError::Validation(
            "at most one app destination is allowed".to_string(),
        ));
    }
    let web_destinations = match object.get("web_destination") {
        Some(v) => json_string_list(v, "web_destination")?,
        None => vec![],
    };
    if web_destinations.len() > MAX_WEB_DESTINATIONS {
        return Err(MeasurementError::Validation(format!(
            "at most {MAX_WEB_DESTINATIONS} web destinations are allowed"
        )));
    }
    if app_destinations.is_empty() && web_destinations.is_empty() {
        return Err(MeasurementError::Validation(
            "source has no destination".to_string(),
        ));
    }

    let event_id = match object.get("source_event_id") {
        Some(v) => json_u64(v, "source_event_id")?,
        None => 0,
    };
    let priority = match object.get("priority") {
        Some(v) => json_i64(v, "priority")?,
        None => 0,
    };
    let debug_key = object
        .get("debug_key")
        .map(|v| json_u64(v, "debug_key"))
        .transpose()?;

    let expiry = source_expiry(&object, ctx.source_type, config)?;

    let aggregatable_report_window = match object.get("aggregatable_report_window") {
        Some(v) => json_seconds(v, "aggregatable_report_window")?
            .clamp(config.min_event_report_window, expiry),
        None => expiry,
    };

    let trigger_data_matching = match object.get("trigger_data_matching") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => TriggerDataMatching::default(),
    };

    let max_event_level_reports = match object.get("max_event_level_reports") {
        Some(v) => {
            let max = json_u64(v, "max_event_level_reports")?;
            if max > config.max_event_level_reports as u64 {
                return Err(MeasurementError::Validation(format!(
                    "max_event_level_reports exceeds {}",
                    config.max_event_level_reports
                )));
            }
            max as u32
        }
        None => config.default_max_reports(ctx.source_type),
    };

    let windows = match (
        object.get("event_report_window"),
        object.get("event_report_windows"),
    ) {
        (Some(_), Some(_)) => {
            return Err(MeasurementError::Parse(
                "event_report_window and event_report_windows are exclusive".to_string(),
            ))
        }
        (Some(single), None) => ReportWindows::single(
            json_seconds(single, "event_report_window")?
                .clamp(config.min_event_report_window, expiry),
        ),
        (None, Some(multiple)) => ReportWindows::parse(multiple, expiry, config)?,
        (None, None) => ReportWindows::with_defaults(
            config.default_early_report_windows(ctx.source_type),
            expiry,
        ),
    };

    let report_config = match object.get("trigger_specs") {
        Some(specs) => ReportConfig::Flexible(TriggerSpecs::parse(
            specs,
            &windows,
            max_event_level_reports,
            trigger_data_matching,
            expiry,
            config,
        )?),
        None => ReportConfig::Legacy(LegacyReportConfig {
            cardinality: config.default_trigger_data_cardinality(ctx.source_type),
            windows,
            max_reports: max_event_level_reports,
        }),
    };

    let filter_data = match object.get("filter_data") {
        Some(v) => FilterMap::parse_source_filter_data(v)?,
        None => FilterMap::new(),
    };
    let aggregation_keys = match object.get("aggregation_keys") {
        Some(v) => parse_aggregation_keys(v, config)?,
        None => Default::default(),
    };
    let shared_aggregation_keys = match object.get("shared_aggregation_keys") {
        Some(v) => json_string_list(v, "shared_aggregation_keys")?,
        None => vec![],
    };
    let shared_filter_data_keys = object
        .get("shared_filter_data_keys")
        .map(|v| json_string_list(v, "shared_filter_data_keys"))
        .transpose()?;

    let attribution_scopes = match object.get("attribution_scopes") {
        Some(v) if config.enable_attribution_scopes => Some(parse_attribution_scopes(v, config)?),
        _ => None,
    };

    let named_budgets = match object.get("named_budgets") {
        Some(v) if config.enable_named_budgets => Some(AggregatableNamedBudgets::parse(
            v,
            config.max_named_budgets_per_source,
            config.max_sum_of_aggregate_values_per_source,
        )?),
        _ => None,
    };

    let event_level_epsilon = match object.get("event_level_epsilon") {
        Some(v) => {
            let epsilon = v.as_f64().ok_or_else(|| {
                MeasurementError::Parse("event_level_epsilon must be a number".to_string())
            })?;
            if !(0.0..=config.max_event_level_epsilon).contains(&epsilon) {
                return Err(MeasurementError::Validation(format!(
                    "event_level_epsilon must be in [0, {}]",
                    config.max_event_level_epsilon
                )));
            }
            Some(epsilon)
        }
        None => None,
    };

    let destination_limit_algorithm = match object.get("destination_limit_algorithm") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => DestinationLimitAlgorithm::default(),
    };

    let source = Source {
        id: ctx.source_id.clone(),
        event_id,
        publisher: ctx.publisher.clone(),
        publisher_type: ctx.publisher_type,
        app_destinations,
        web_destinations,
        enrollment_id: ctx.enrollment_id.clone(),
        registration_origin: ctx.registration_origin.clone(),
        source_type: ctx.source_type,
        priority,
        event_time: ctx.event_time,
        expiry_time: ctx.event_time.saturating_add(expiry),
        aggregatable_report_window: ctx.event_time.saturating_add(aggregatable_report_window),
        status: SourceStatus::Active,
        attribution_mode: AttributionMode::Unassigned,
        event_report_dedup_keys: BoundedDedupKeys::new(max_event_level_reports as usize),
        aggregate_report_dedup_keys: BoundedDedupKeys::new(config.max_aggregate_reports_per_source),
        report_config,
        trigger_data_matching,
        attribution_scopes,
        filter_data,
        shared_filter_data_keys,
        aggregation_keys,
        shared_aggregation_keys,
        aggregate_contributions: ContributionFilter {
            consumed: 0,
            capacity: config.max_sum_of_aggregate_values_per_source,
        },
        named_budgets,
        debug_key,
        debug_reporting: json_bool(&object, "debug_reporting")?,
        event_level_epsilon,
        destination_limit_algorithm,
        privacy_parameters: None,
        parent_id: None,
    };
    debug!("Parsed source {}: {:?}", source.id, source.report_config);
    Ok(source)
}

/// Expiry relative to the event time. Event sources are rounded to whole
/// days.
fn source_expiry(
    object: &Map<String, Value>,
    source_type: SourceType,
    config: &EngineConfig,
) -> Result<Timestamp, MeasurementError> {
    let expiry = match object.get("expiry") {
        Some(v) => json_seconds(v, "expiry")?,
        None => config.max_source_expiry,
    };
    let expiry = expiry.clamp(config.min_source_expiry, config.max_source_expiry);
    Ok(match source_type {
        SourceType::Event => {
            let days = (expiry + ONE_DAY_MS / 2) / ONE_DAY_MS;
            (days * ONE_DAY_MS).clamp(config.min_source_expiry, config.max_source_expiry)
        }
        SourceType::Navigation => expiry,
    })
}

fn parse_attribution_scopes(
    value: &Value,
    config: &EngineConfig,
) -> Result<AttributionScopes, MeasurementError> {
    let limit = value
        .get("limit")
        .map(|v| json_u64(v, "attribution_scopes.limit"))
        .transpose()?
        .ok_or_else(|| MeasurementError::Parse("attribution_scopes lacks limit".to_string()))?;
    if limit == 0 {
        return Err(MeasurementError::Validation(
            "attribution scope limit must be positive".to_string(),
        ));
    }
    let scopes = value
        .get("values")
        .map(|v| json_string_list(v, "attribution_scopes.values"))
        .transpose()?
        .unwrap_or_default();
    let max_scopes = config.max_attribution_scopes_per_source.min(limit as usize);
    if scopes.is_empty() || scopes.len() > max_scopes {
        return Err(MeasurementError::Validation(format!(
            "attribution scopes must hold 1 to {max_scopes} values"
        )));
    }
    if scopes
        .iter()
        .any(|scope| scope.len() > config.max_attribution_scope_length)
    {
        return Err(MeasurementError::Validation(
            "attribution scope is too long".to_string(),
        ));
    }
    let max_event_states = match value.get("max_event_states") {
        Some(v) => json_u64(v, "attribution_scopes.max_event_states")?,
        None => config.default_max_event_states,
    };
    if max_event_states == 0 {
        return Err(MeasurementError::Validation(
            "max_event_states must be positive".to_string(),
        ));
    }
    Ok(AttributionScopes {
        scopes,
        limit,
        max_event_states,
    })
}

/// Parses and validates a trigger registration payload.
pub fn parse_trigger(
    json: &str,
    ctx: &TriggerRegistrationContext,
    config: &EngineConfig,
) -> Result<Trigger, MeasurementError> {
    let object = parse_object(json)?;

    let event_triggers = match object.get("event_trigger_data") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| parse_event_trigger(entry, config))
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(MeasurementError::Parse(
                "event_trigger_data must be a list".to_string(),
            ))
        }
        None => vec![],
    };

    let aggregatable_trigger_data = match object.get("aggregatable_trigger_data") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| AggregatableTriggerData::parse(entry, config))
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(MeasurementError::Parse(
                "aggregatable_trigger_data must be a list".to_string(),
            ))
        }
        None => vec![],
    };

    let aggregatable_values = match object.get("aggregatable_values") {
        Some(v) => parse_aggregatable_values(v, config)?,
        None => vec![],
    };

    let aggregatable_dedup_keys = match object.get("aggregatable_deduplication_keys") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| AggregateDeduplicationKey::parse(entry, config))
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(MeasurementError::Parse(
                "aggregatable_deduplication_keys must be a list".to_string(),
            ))
        }
        None => vec![],
    };

    let named_budgets = match object.get("named_budgets") {
        Some(Value::Array(entries)) if config.enable_named_budgets => entries
            .iter()
            .map(|entry| NamedBudgetSelector::parse(entry, config))
            .collect::<Result<_, _>>()?,
        Some(Value::Array(_)) => vec![],
        Some(_) => {
            return Err(MeasurementError::Parse(
                "named_budgets must be a list".to_string(),
            ))
        }
        None => vec![],
    };

    let attribution_scopes = match object.get("attribution_scopes") {
        Some(v) if config.enable_attribution_scopes => {
            json_string_list(v, "attribution_scopes")?
        }
        _ => vec![],
    };

    let aggregation_coordinator_origin = match object.get("aggregation_coordinator_origin") {
        Some(Value::String(origin)) => Some(origin.clone()),
        Some(_) => {
            return Err(MeasurementError::Parse(
                "aggregation_coordinator_origin must be a string".to_string(),
            ))
        }
        None => None,
    };

    let trigger = Trigger {
        id: ctx.trigger_id.clone(),
        attribution_destination: ctx.destination.clone(),
        destination_type: ctx.destination_type,
        enrollment_id: ctx.enrollment_id.clone(),
        registration_origin: ctx.registration_origin.clone(),
        trigger_time: ctx.trigger_time,
        status: TriggerStatus::Pending,
        event_triggers,
        aggregatable_trigger_data,
        aggregatable_values,
        aggregatable_dedup_keys,
        named_budgets,
        filters: optional_filter_set(object.get("filters"), config)?,
        not_filters: optional_filter_set(object.get("not_filters"), config)?,
        attribution_scopes,
        debug_key: object
            .get("debug_key")
            .map(|v| json_u64(v, "debug_key"))
            .transpose()?,
        debug_reporting: json_bool(&object, "debug_reporting")?,
        aggregation_coordinator_origin,
    };
    debug!(
        "Parsed trigger {} with {} event trigger entries",
        trigger.id,
        trigger.event_triggers.len()
    );
    Ok(trigger)
}

fn parse_event_trigger(value: &Value, config: &EngineConfig) -> Result<EventTrigger, MeasurementError> {
    let object = value.as_object().ok_or_else(|| {
        MeasurementError::Parse("event_trigger_data entry must be an object".to_string())
    })?;
    let value = match object.get("value") {
        Some(v) => json_u64(v, "value")?,
        None => 1,
    };
    if value == 0 || value > u32::MAX as u64 {
        return Err(MeasurementError::Validation(
            "event trigger value must be a positive 32-bit value".to_string(),
        ));
    }
    Ok(EventTrigger {
        trigger_data: match object.get("trigger_data") {
            Some(v) => json_u64(v, "trigger_data")?,
            None => 0,
        },
        priority: match object.get("priority") {
            Some(v) => json_i64(v, "priority")?,
            None => 0,
        },
        dedup_key: object
            .get("deduplication_key")
            .map(|v| json_u64(v, "deduplication_key"))
            .transpose()?,
        filters: optional_filter_set(object.get("filters"), config)?,
        not_filters: optional_filter_set(object.get("not_filters"), config)?,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_ctx(source_type: SourceType) -> SourceRegistrationContext {
        SourceRegistrationContext {
            source_id: "S1".to_string(),
            publisher: "android-app://com.publisher".to_string(),
            publisher_type: EventSurfaceType::App,
            enrollment_id: "enrollment-1".to_string(),
            registration_origin: "https://adtech.test".to_string(),
            source_type,
            event_time: 1_000,
        }
    }

    fn trigger_ctx() -> TriggerRegistrationContext {
        TriggerRegistrationContext {
            trigger_id: "T1".to_string(),
            destination: "android-app://com.advertiser".to_string(),
            destination_type: EventSurfaceType::App,
            enrollment_id: "enrollment-1".to_string(),
            registration_origin: "https://adtech.test".to_string(),
            trigger_time: 5_000,
        }
    }

    #[test]
    fn test_parse_legacy_navigation_source() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let source = parse_source(
            r#"{
                "destination": "android-app://com.advertiser",
                "source_event_id": "18446744073709551615",
                "priority": "-5",
                "expiry": "864000",
                "filter_data": {"product": ["shoes"]},
                "aggregation_keys": {"campaignCounts": "0x159"},
                "debug_reporting": true
            }"#,
            &source_ctx(SourceType::Navigation),
            &config,
        )?;
        assert_eq!(source.event_id, u64::MAX);
        assert_eq!(source.priority, -5);
        assert_eq!(source.expiry_time, 1_000 + 10 * ONE_DAY_MS);
        assert!(source.debug_reporting);
        assert_eq!(source.aggregation_keys["campaignCounts"], 0x159);
        match &source.report_config {
            ReportConfig::Legacy(legacy) => {
                assert_eq!(legacy.cardinality, 8);
                assert_eq!(legacy.max_reports, 3);
                assert_eq!(
                    legacy.windows.ends,
                    vec![2 * ONE_DAY_MS, 7 * ONE_DAY_MS, 10 * ONE_DAY_MS]
                );
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert_eq!(source.event_report_dedup_keys.capacity(), 3);
        Ok(())
    }

    #[test]
    fn test_event_source_expiry_rounds_to_days() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let source = parse_source(
            r#"{"web_destination": "https://advertiser.test", "expiry": 216000}"#,
            &source_ctx(SourceType::Event),
            &config,
        )?;
        // 2.5 days rounds to 3 days.
        assert_eq!(source.expiry_time - source.event_time, 3 * ONE_DAY_MS);
        Ok(())
    }

    #[test]
    fn test_parse_flexible_source() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let source = parse_source(
            r#"{
                "destination": "android-app://com.advertiser",
                "max_event_level_reports": 2,
                "trigger_data_matching": "exact",
                "trigger_specs": [{
                    "trigger_data": [1, 5],
                    "event_report_windows": {"end_times": [3600, 86400]},
                    "summary_window_operator": "value_sum",
                    "summary_buckets": [10, 100]
                }],
                "attribution_scopes": {"limit": 3, "values": ["a", "b"], "max_event_states": 5},
                "named_budgets": {"biddable": 100},
                "destination_limit_algorithm": "FIFO",
                "event_level_epsilon": 10.5
            }"#,
            &source_ctx(SourceType::Navigation),
            &config,
        )?;
        assert!(matches!(source.report_config, ReportConfig::Flexible(_)));
        assert_eq!(source.trigger_data_matching, TriggerDataMatching::Exact);
        assert_eq!(source.destination_limit_algorithm, DestinationLimitAlgorithm::Fifo);
        assert_eq!(source.event_level_epsilon, Some(10.5));
        let scopes = source.attribution_scopes.ok_or_else(|| anyhow::anyhow!("no scopes"))?;
        assert_eq!(scopes.max_event_states, 5);
        assert!(source.named_budgets.is_some());
        assert_eq!(source.report_config.max_reports(), 2);
        Ok(())
    }

    #[test]
    fn test_invalid_sources() {
        let config = EngineConfig::default();
        let ctx = source_ctx(SourceType::Navigation);
        for payload in [
            "[]",
            "{}",
            r#"{"destination": ["a", "b"]}"#,
            r#"{"destination": "a", "max_event_level_reports": 21}"#,
            r#"{"destination": "a", "event_report_window": 3600, "event_report_windows": {"end_times": [3600]}}"#,
            r#"{"destination": "a", "attribution_scopes": {"limit": 1, "values": ["a", "b"]}}"#,
            r#"{"destination": "a", "event_level_epsilon": 15}"#,
            r#"{"destination": "a", "aggregation_keys": {"k": "12"}}"#,
        ] {
            assert!(parse_source(payload, &ctx, &config).is_err(), "{payload}");
        }
    }

    #[test]
    fn test_parse_trigger() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let trigger = parse_trigger(
            r#"{
                "event_trigger_data": [
                    {"trigger_data": "2", "priority": "10", "deduplication_key": "7", "filters": {"product": ["shoes"]}},
                    {"trigger_data": "3"}
                ],
                "aggregatable_trigger_data": [{"key_piece": "0x400", "source_keys": ["campaignCounts"]}],
                "aggregatable_values": {"campaignCounts": 100},
                "aggregatable_deduplication_keys": [{"deduplication_key": "10"}],
                "named_budgets": [{"name": "biddable", "filters": {"product": ["shoes"]}}],
                "not_filters": {"product": ["hats"]},
                "attribution_scopes": ["a"],
                "debug_key": "99"
            }"#,
            &trigger_ctx(),
            &config,
        )?;
        assert_eq!(trigger.status, TriggerStatus::Pending);
        assert_eq!(trigger.event_triggers.len(), 2);
        assert_eq!(trigger.event_triggers[0].dedup_key, Some(7));
        assert_eq!(trigger.event_triggers[1].value, 1);
        assert_eq!(trigger.aggregatable_trigger_data[0].key_piece, 0x400);
        assert_eq!(trigger.aggregatable_dedup_keys[0].deduplication_key, Some(10));
        assert_eq!(trigger.named_budgets[0].name.as_deref(), Some("biddable"));
        assert_eq!(trigger.not_filters.len(), 1);
        assert_eq!(trigger.debug_key, Some(99));
        assert_eq!(trigger.trigger_time, 5_000);
        Ok(())
    }

    #[test]
    fn test_malformed_trigger_is_rejected() {
        let config = EngineConfig::default();
        for payload in [
            r#"{"event_trigger_data": {"trigger_data": "1"}}"#,
            r#"{"filters": "product"}"#,
            r#"{"aggregatable_values": {"a": -1}}"#,
            r#"{"event_trigger_data": [{"value": 0}]}"#,
        ] {
            assert!(parse_trigger(payload, &trigger_ctx(), &config).is_err(), "{payload}");
        }
    }
}
