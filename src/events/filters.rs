use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::{SourceType, Timestamp};
use crate::error::MeasurementError;

pub const SOURCE_TYPE_KEY: &str = "source_type";
pub const LOOKBACK_WINDOW_KEY: &str = "_lookback_window";

const MAX_FILTER_KEY_LENGTH: usize = 25;
const MAX_FILTER_VALUES: usize = 50;

/// Value side of a filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterValue {
    List(Vec<String>),
    /// Maximum trigger-time minus source-time, in milliseconds.
    Lookback(Timestamp),
}

/// String-keyed multi-value predicate. Used both as source filter data and
/// as one disjunct of a trigger's `filters`/`not_filters`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMap {
    entries: BTreeMap<String, FilterValue>,
}

/// A trigger filter set matches when any of its maps matches.
pub type FilterSet = Vec<FilterMap>;

impl FilterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.entries.insert(key.into(), FilterValue::List(values));
    }

    pub fn insert_lookback(&mut self, lookback: Timestamp) {
        self.entries
            .insert(LOOKBACK_WINDOW_KEY.to_string(), FilterValue::Lookback(lookback));
    }

    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Source filter data as seen by triggers, with the implicit
    /// `source_type` key.
    pub fn with_source_type(&self, source_type: SourceType) -> FilterMap {
        let mut map = self.clone();
        map.insert(SOURCE_TYPE_KEY, vec![source_type.as_str().to_string()]);
        map
    }

    /// Restricts the map to the given keys.
    pub fn retain_keys(&self, keys: &[String]) -> FilterMap {
        FilterMap {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Parses source `filter_data`. Reserved keys are rejected.
    pub fn parse_source_filter_data(value: &Value) -> Result<Self, MeasurementError> {
        let object = value.as_object().ok_or_else(|| {
            MeasurementError::Parse("filter_data must be an object".to_string())
        })?;
        let mut map = FilterMap::new();
        for (key, values) in object {
            if key == SOURCE_TYPE_KEY || key.starts_with('_') {
                return Err(MeasurementError::Parse(format!(
                    "filter_data uses reserved key {key}"
                )));
            }
            map.insert(key.clone(), parse_string_list(key, values)?);
        }
        Ok(map)
    }

    /// Parses one trigger-side filter map.
    pub fn parse_trigger_filter(value: &Value) -> Result<Self, MeasurementError> {
        let object = value.as_object().ok_or_else(|| {
            MeasurementError::Parse("filter must be an object".to_string())
        })?;
        let mut map = FilterMap::new();
        for (key, values) in object {
            if key == LOOKBACK_WINDOW_KEY {
                let seconds = values.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                    MeasurementError::Parse(
                        "_lookback_window must be a positive integer".to_string(),
                    )
                })?;
                map.insert_lookback(seconds.saturating_mul(1000));
                continue;
            }
            if key.starts_with('_') {
                return Err(MeasurementError::Parse(format!(
                    "filter uses reserved key {key}"
                )));
            }
            map.insert(key.clone(), parse_string_list(key, values)?);
        }
        Ok(map)
    }
}

fn parse_string_list(key: &str, values: &Value) -> Result<Vec<String>, MeasurementError> {
    if key.len() > MAX_FILTER_KEY_LENGTH {
        return Err(MeasurementError::Parse(format!("filter key {key} is too long")));
    }
    let list = values.as_array().ok_or_else(|| {
        MeasurementError::Parse(format!("filter values for {key} must be a list"))
    })?;
    if list.len() > MAX_FILTER_VALUES {
        return Err(MeasurementError::Parse(format!(
            "too many filter values for {key}"
        )));
    }
    list.iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                MeasurementError::Parse(format!("filter value for {key} must be a string"))
            })
        })
        .collect()
}

/// Parses `filters`/`not_filters`, which may be a single object or a list
/// of objects.
pub fn parse_filter_set(value: &Value, max_maps: usize) -> Result<FilterSet, MeasurementError> {
    let set: FilterSet = match value {
        Value::Array(items) => items
            .iter()
            .map(FilterMap::parse_trigger_filter)
            .collect::<Result<_, _>>()?,
        Value::Object(_) => vec![FilterMap::parse_trigger_filter(value)?],
        _ => {
            return Err(MeasurementError::Parse(
                "filters must be an object or a list".to_string(),
            ))
        }
    };
    if set.len() > max_maps {
        return Err(MeasurementError::Parse("too many filter maps".to_string()));
    }
    Ok(set)
}

/// Evaluates trigger `filters`/`not_filters` against source filter data.
#[derive(Debug, Clone, Copy)]
pub struct FilterMatcher {
    /// Time elapsed between source and trigger.
    pub elapsed: Timestamp,
    pub lookback_enabled: bool,
}

impl FilterMatcher {
    pub fn new(source_time: Timestamp, trigger_time: Timestamp, lookback_enabled: bool) -> Self {
        Self {
            elapsed: trigger_time.saturating_sub(source_time),
            lookback_enabled,
        }
    }

    /// Both the positive and negative sets must match.
    pub fn matches(
        &self,
        source_data: &FilterMap,
        filters: &[FilterMap],
        not_filters: &[FilterMap],
    ) -> bool {
        self.is_match(source_data, filters, true) && self.is_match(source_data, not_filters, false)
    }

    /// An empty set always matches; otherwise any map of the set must match.
    pub fn is_match(&self, source_data: &FilterMap, set: &[FilterMap], is_filter: bool) -> bool {
        set.is_empty() || set.iter().any(|map| self.map_matches(source_data, map, is_filter))
    }

    fn map_matches(&self, source_data: &FilterMap, trigger: &FilterMap, is_filter: bool) -> bool {
        for (key, trigger_value) in &trigger.entries {
            let trigger_values = match trigger_value {
                FilterValue::Lookback(lookback) => {
                    if !self.lookback_enabled {
                        continue;
                    }
                    let within = self.elapsed <= *lookback;
                    if within != is_filter {
                        return false;
                    }
                    continue;
                }
                FilterValue::List(values) => values,
            };

            // Keys the source does not declare are ignored.
            let Some(FilterValue::List(source_values)) = source_data.get(key) else {
                continue;
            };

            let matched = if trigger_values.is_empty() {
                source_values.is_empty() == is_filter
            } else {
                let intersects = trigger_values.iter().any(|v| source_values.contains(v));
                intersects == is_filter
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::traits::ONE_DAY_MS;

    fn source_data() -> FilterMap {
        let mut map = FilterMap::new();
        map.insert("product", vec!["shoes".to_string(), "socks".to_string()]);
        map.insert("campaign", vec![]);
        map.with_source_type(SourceType::Navigation)
    }

    #[test]
    fn test_filters_and_not_filters() -> Result<(), anyhow::Error> {
        let matcher = FilterMatcher::new(0, ONE_DAY_MS, true);
        let data = source_data();

        let filters = parse_filter_set(&json!({"product": ["shoes"]}), 20)?;
        assert!(matcher.matches(&data, &filters, &[]));

        let filters = parse_filter_set(&json!({"product": ["hats"]}), 20)?;
        assert!(!matcher.matches(&data, &filters, &[]));

        // Any map of the set may match.
        let filters =
            parse_filter_set(&json!([{"product": ["hats"]}, {"source_type": ["navigation"]}]), 20)?;
        assert!(matcher.matches(&data, &filters, &[]));

        let not_filters = parse_filter_set(&json!({"source_type": ["event"]}), 20)?;
        assert!(matcher.matches(&data, &[], &not_filters));
        let not_filters = parse_filter_set(&json!({"product": ["socks"]}), 20)?;
        assert!(!matcher.matches(&data, &[], &not_filters));

        // Keys missing from the source are ignored.
        let filters = parse_filter_set(&json!({"color": ["red"]}), 20)?;
        assert!(matcher.matches(&data, &filters, &[]));

        // Empty trigger values only match empty source values.
        let filters = parse_filter_set(&json!({"campaign": []}), 20)?;
        assert!(matcher.matches(&data, &filters, &[]));
        let filters = parse_filter_set(&json!({"product": []}), 20)?;
        assert!(!matcher.matches(&data, &filters, &[]));
        Ok(())
    }

    #[test]
    fn test_lookback_window() -> Result<(), anyhow::Error> {
        let data = source_data();
        let filters = parse_filter_set(&json!({"_lookback_window": 3600}), 20)?;

        let recent = FilterMatcher::new(0, 1000 * 3600, true);
        assert!(recent.matches(&data, &filters, &[]));
        assert!(!recent.matches(&data, &[], &filters));

        let old = FilterMatcher::new(0, 1000 * 3601, true);
        assert!(!old.matches(&data, &filters, &[]));
        assert!(old.matches(&data, &[], &filters));

        let disabled = FilterMatcher::new(0, 1000 * 3601, false);
        assert!(disabled.matches(&data, &filters, &[]));
        Ok(())
    }

    #[test]
    fn test_reserved_keys_rejected() {
        assert!(FilterMap::parse_source_filter_data(&json!({"source_type": ["x"]})).is_err());
        assert!(FilterMap::parse_trigger_filter(&json!({"_other": ["x"]})).is_err());
        assert!(FilterMap::parse_trigger_filter(&json!({"_lookback_window": -1})).is_err());
    }
}
