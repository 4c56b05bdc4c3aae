use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    bounded::AttributedTriggers,
    parsing::{json_seconds, json_u64},
    traits::Timestamp,
};
use crate::{config::EngineConfig, error::MeasurementError};

/// Report windows of a source, as offsets from the source event time.
/// Window `i` covers `[ends[i-1], ends[i])`, the first one starting at
/// `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindows {
    pub start: Timestamp,
    pub ends: Vec<Timestamp>,
}

impl ReportWindows {
    /// Single window covering the whole source lifetime.
    pub fn single(end: Timestamp) -> Self {
        Self {
            start: 0,
            ends: vec![end],
        }
    }

    /// Default windows: the early windows that close before `expiry`, then
    /// a final window ending at `expiry`.
    pub fn with_defaults(early_windows: &[Timestamp], expiry: Timestamp) -> Self {
        let mut ends: Vec<Timestamp> =
            early_windows.iter().copied().filter(|end| *end < expiry).collect();
        ends.push(expiry);
        Self { start: 0, ends }
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    /// Index of the window containing `elapsed` (trigger time minus source
    /// time), or `None` if the trigger falls outside every window.
    pub fn window_index(&self, elapsed: Timestamp) -> Option<usize> {
        if elapsed < self.start {
            return None;
        }
        self.ends.iter().position(|end| elapsed < *end)
    }

    pub fn end(&self, index: usize) -> Option<Timestamp> {
        self.ends.get(index).copied()
    }

    pub fn last_end(&self) -> Timestamp {
        self.ends.last().copied().unwrap_or(self.start)
    }

    /// Parses `{"start_time": s, "end_times": [..]}` (seconds), clamping
    /// ends into `[min_window, expiry]`.
    pub fn parse(
        value: &Value,
        expiry: Timestamp,
        config: &EngineConfig,
    ) -> Result<Self, MeasurementError> {
        let object = value.as_object().ok_or_else(|| {
            MeasurementError::Parse("event_report_windows must be an object".to_string())
        })?;
        let start = match object.get("start_time") {
            Some(v) => json_seconds(v, "start_time")?,
            None => 0,
        };
        let raw_ends = object
            .get("end_times")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MeasurementError::Parse("end_times must be a non-empty list".to_string())
            })?;
        if raw_ends.is_empty() || raw_ends.len() > config.max_report_windows_per_spec {
            return Err(MeasurementError::Parse(format!(
                "end_times must hold 1 to {} windows",
                config.max_report_windows_per_spec
            )));
        }
        if start >= expiry {
            return Err(MeasurementError::Validation(
                "report window start is after source expiry".to_string(),
            ));
        }

        let mut ends = Vec::with_capacity(raw_ends.len());
        let mut previous = start;
        for raw in raw_ends {
            let end = json_seconds(raw, "end_times")?
                .clamp(config.min_event_report_window, expiry);
            if end <= previous {
                return Err(MeasurementError::Validation(
                    "report window ends must be strictly increasing".to_string(),
                ));
            }
            ends.push(end);
            previous = end;
        }
        Ok(Self { start, ends })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryOperator {
    #[default]
    Count,
    ValueSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDataMatching {
    #[default]
    Modulus,
    Exact,
}

/// One trigger-data bucket group of the flexible model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub trigger_data: Vec<u64>,
    pub windows: ReportWindows,
    pub summary_operator: SummaryOperator,
    /// Strictly increasing thresholds; each one crossed is a distinct
    /// report state.
    pub summary_buckets: Vec<u64>,
}

impl TriggerSpec {
    /// Index of the highest summary bucket reached by `total`.
    pub fn bucket_index(&self, total: u64) -> Option<usize> {
        self.summary_buckets
            .iter()
            .rposition(|threshold| *threshold <= total)
    }

    /// Inclusive value range represented by bucket `index`.
    pub fn bucket_range(&self, index: usize) -> Option<(u64, u64)> {
        let low = *self.summary_buckets.get(index)?;
        let high = self
            .summary_buckets
            .get(index + 1)
            .map(|next| next - 1)
            .unwrap_or(u32::MAX as u64);
        Some((low, high))
    }
}

/// Flexible event-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpecs {
    pub specs: Vec<TriggerSpec>,
    pub max_event_level_reports: u32,
    pub attributed_triggers: AttributedTriggers,
}

impl TriggerSpecs {
    pub fn new(specs: Vec<TriggerSpec>, max_event_level_reports: u32) -> Self {
        Self {
            specs,
            max_event_level_reports,
            attributed_triggers: AttributedTriggers::new(max_event_level_reports as usize),
        }
    }

    /// All declared trigger data, ascending.
    pub fn trigger_data(&self) -> Vec<u64> {
        let set: BTreeSet<u64> = self
            .specs
            .iter()
            .flat_map(|spec| spec.trigger_data.iter().copied())
            .collect();
        set.into_iter().collect()
    }

    pub fn spec_for(&self, trigger_data: u64) -> Option<&TriggerSpec> {
        self.specs
            .iter()
            .find(|spec| spec.trigger_data.contains(&trigger_data))
    }

    /// Maps a trigger's raw trigger data onto a declared value.
    pub fn resolve_trigger_data(&self, raw: u64, matching: TriggerDataMatching) -> Option<u64> {
        let all = self.trigger_data();
        match matching {
            TriggerDataMatching::Exact => all.contains(&raw).then_some(raw),
            TriggerDataMatching::Modulus => {
                if all.is_empty() {
                    return None;
                }
                all.get((raw % all.len() as u64) as usize).copied()
            }
        }
    }

    /// Parses the `trigger_specs` list of a source registration.
    pub fn parse(
        value: &Value,
        default_windows: &ReportWindows,
        max_event_level_reports: u32,
        matching: TriggerDataMatching,
        expiry: Timestamp,
        config: &EngineConfig,
    ) -> Result<Self, MeasurementError> {
        let list = value.as_array().ok_or_else(|| {
            MeasurementError::Parse("trigger_specs must be a list".to_string())
        })?;
        if list.is_empty() {
            return Err(MeasurementError::Parse("trigger_specs is empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        let mut specs = Vec::with_capacity(list.len());
        for item in list {
            let spec = parse_trigger_spec(item, default_windows, max_event_level_reports, expiry, config)?;
            for data in &spec.trigger_data {
                if !seen.insert(*data) {
                    return Err(MeasurementError::Validation(format!(
                        "trigger data {data} declared twice"
                    )));
                }
            }
            specs.push(spec);
        }
        if seen.len() > config.max_trigger_data_cardinality {
            return Err(MeasurementError::Validation(format!(
                "more than {} trigger data values",
                config.max_trigger_data_cardinality
            )));
        }
        // Modulus matching needs a contiguous range starting at zero.
        if matching == TriggerDataMatching::Modulus
            && seen.iter().enumerate().any(|(i, data)| *data != i as u64)
        {
            return Err(MeasurementError::Validation(
                "modulus matching requires trigger data 0..n".to_string(),
            ));
        }
        Ok(Self::new(specs, max_event_level_reports))
    }
}

fn parse_trigger_spec(
    value: &Value,
    default_windows: &ReportWindows,
    max_event_level_reports: u32,
    expiry: Timestamp,
    config: &EngineConfig,
) -> Result<TriggerSpec, MeasurementError> {
    let object = value
        .as_object()
        .ok_or_else(|| MeasurementError::Parse("trigger spec must be an object".to_string()))?;

    let trigger_data: Vec<u64> = object
        .get("trigger_data")
        .and_then(Value::as_array)
        .ok_or_else(|| MeasurementError::Parse("trigger spec lacks trigger_data".to_string()))?
        .iter()
        .map(|v| json_u64(v, "trigger_data"))
        .collect::<Result<_, _>>()?;
    if trigger_data.is_empty() || trigger_data.iter().any(|d| *d > u32::MAX as u64) {
        return Err(MeasurementError::Validation(
            "trigger_data must be non-empty 32-bit values".to_string(),
        ));
    }

    let windows = match object.get("event_report_windows") {
        Some(v) => ReportWindows::parse(v, expiry, config)?,
        None => default_windows.clone(),
    };

    let summary_operator = match object.get("summary_window_operator") {
        None => SummaryOperator::Count,
        Some(v) => serde_json::from_value(v.clone())?,
    };

    let summary_buckets: Vec<u64> = match object.get("summary_buckets") {
        None => (1..=max_event_level_reports as u64).collect(),
        Some(v) => v
            .as_array()
            .ok_or_else(|| MeasurementError::Parse("summary_buckets must be a list".to_string()))?
            .iter()
            .map(|b| json_u64(b, "summary_buckets"))
            .collect::<Result<_, _>>()?,
    };
    if summary_buckets.is_empty()
        || summary_buckets.len() > max_event_level_reports as usize
        || summary_buckets[0] == 0
        || summary_buckets.windows(2).any(|w| w[0] >= w[1])
    {
        return Err(MeasurementError::Validation(
            "summary_buckets must be strictly increasing positive values".to_string(),
        ));
    }

    Ok(TriggerSpec {
        trigger_data,
        windows,
        summary_operator,
        summary_buckets,
    })
}

/// Fixed trigger-data configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyReportConfig {
    pub cardinality: u64,
    pub windows: ReportWindows,
    pub max_reports: u32,
}

/// Report-shape configuration of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportConfig {
    Legacy(LegacyReportConfig),
    Flexible(TriggerSpecs),
}

/// One trigger-data value as seen by the privacy accounting: how many
/// windows it can report in and at most how many reports it can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportTypeShape {
    pub trigger_data: u64,
    pub windows: usize,
    pub cap: u32,
}

impl ReportConfig {
    pub fn max_reports(&self) -> u32 {
        match self {
            ReportConfig::Legacy(legacy) => legacy.max_reports,
            ReportConfig::Flexible(specs) => specs.max_event_level_reports,
        }
    }

    pub fn report_types(&self) -> Vec<ReportTypeShape> {
        match self {
            ReportConfig::Legacy(legacy) => (0..legacy.cardinality)
                .map(|trigger_data| ReportTypeShape {
                    trigger_data,
                    windows: legacy.windows.len(),
                    cap: legacy.max_reports,
                })
                .collect(),
            ReportConfig::Flexible(specs) => specs
                .trigger_data()
                .into_iter()
                .filter_map(|trigger_data| {
                    let spec = specs.spec_for(trigger_data)?;
                    Some(ReportTypeShape {
                        trigger_data,
                        windows: spec.windows.len(),
                        cap: spec.summary_buckets.len() as u32,
                    })
                })
                .collect(),
        }
    }

    /// Same configuration with no attributed triggers.
    pub fn reset(&self) -> Self {
        match self {
            ReportConfig::Legacy(legacy) => ReportConfig::Legacy(legacy.clone()),
            ReportConfig::Flexible(specs) => ReportConfig::Flexible(TriggerSpecs::new(
                specs.specs.clone(),
                specs.max_event_level_reports,
            )),
        }
    }

    pub fn windows_for(&self, trigger_data: u64) -> Option<&ReportWindows> {
        match self {
            ReportConfig::Legacy(legacy) => Some(&legacy.windows),
            ReportConfig::Flexible(specs) => specs.spec_for(trigger_data).map(|s| &s.windows),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::traits::{ONE_DAY_MS, ONE_HOUR_MS};

    #[test]
    fn test_default_windows_drop_late_early_windows() {
        let windows = ReportWindows::with_defaults(&[2 * ONE_DAY_MS, 7 * ONE_DAY_MS], 5 * ONE_DAY_MS);
        assert_eq!(windows.ends, vec![2 * ONE_DAY_MS, 5 * ONE_DAY_MS]);
        assert_eq!(windows.window_index(ONE_DAY_MS), Some(0));
        assert_eq!(windows.window_index(3 * ONE_DAY_MS), Some(1));
        assert_eq!(windows.window_index(6 * ONE_DAY_MS), None);
    }

    #[test]
    fn test_parse_windows() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let windows = ReportWindows::parse(
            &json!({"start_time": 0, "end_times": [60, 86400, 172800]}),
            30 * ONE_DAY_MS,
            &config,
        )?;
        // The first end is raised to the minimum window.
        assert_eq!(windows.ends, vec![ONE_HOUR_MS, ONE_DAY_MS, 2 * ONE_DAY_MS]);

        let unordered = ReportWindows::parse(
            &json!({"end_times": [86400, 7200]}),
            30 * ONE_DAY_MS,
            &config,
        );
        assert!(unordered.is_err());
        Ok(())
    }

    #[test]
    fn test_parse_trigger_specs() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let default_windows = ReportWindows::single(30 * ONE_DAY_MS);
        let specs = TriggerSpecs::parse(
            &json!([
                {"trigger_data": [0, 1], "summary_window_operator": "value_sum", "summary_buckets": [5, 10, 20]},
                {"trigger_data": [2], "event_report_windows": {"end_times": [86400, 172800]}}
            ]),
            &default_windows,
            3,
            TriggerDataMatching::Modulus,
            30 * ONE_DAY_MS,
            &config,
        )?;
        assert_eq!(specs.trigger_data(), vec![0, 1, 2]);
        let spec = specs.spec_for(1).ok_or_else(|| anyhow::anyhow!("missing spec"))?;
        assert_eq!(spec.summary_operator, SummaryOperator::ValueSum);
        assert_eq!(spec.bucket_index(4), None);
        assert_eq!(spec.bucket_index(12), Some(1));
        assert_eq!(spec.bucket_range(1), Some((10, 19)));
        assert_eq!(specs.spec_for(2).map(|s| s.summary_buckets.clone()), Some(vec![1, 2, 3]));
        assert_eq!(specs.resolve_trigger_data(7, TriggerDataMatching::Modulus), Some(1));
        assert_eq!(specs.resolve_trigger_data(7, TriggerDataMatching::Exact), None);
        Ok(())
    }

    #[test]
    fn test_duplicate_trigger_data_rejected() {
        let config = EngineConfig::default();
        let result = TriggerSpecs::parse(
            &json!([{"trigger_data": [0, 1]}, {"trigger_data": [1]}]),
            &ReportWindows::single(ONE_DAY_MS),
            3,
            TriggerDataMatching::Exact,
            ONE_DAY_MS,
            &config,
        );
        assert!(matches!(result, Err(MeasurementError::Validation(_))));
    }

    #[test]
    fn test_modulus_requires_contiguous_data() {
        let config = EngineConfig::default();
        let result = TriggerSpecs::parse(
            &json!([{"trigger_data": [1, 3]}]),
            &ReportWindows::single(ONE_DAY_MS),
            3,
            TriggerDataMatching::Modulus,
            ONE_DAY_MS,
            &config,
        );
        assert!(result.is_err());
    }
}
