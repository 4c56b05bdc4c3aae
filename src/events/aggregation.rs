use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    filters::{parse_filter_set, FilterSet},
    parsing::json_u64,
};
use crate::{config::EngineConfig, error::MeasurementError};

const MAX_KEY_ID_LENGTH: usize = 25;
pub const MAX_AGGREGATABLE_VALUE: u64 = 65536;

/// Parses a `0x`-prefixed hex key piece of at most 128 bits.
pub fn parse_key_piece(raw: &str) -> Result<u128, MeasurementError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| MeasurementError::Parse(format!("key piece {raw} lacks 0x prefix")))?;
    if digits.is_empty() || digits.len() > 32 {
        return Err(MeasurementError::Parse(format!("key piece {raw} has bad length")));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| MeasurementError::Parse(format!("key piece {raw}: {e}")))
}

/// Hex encoding used for histogram buckets.
pub fn format_key_piece(key: u128) -> String {
    format!("0x{key:x}")
}

/// Source aggregation keys: key id to 128-bit key piece.
pub type AggregationKeys = BTreeMap<String, u128>;

pub fn parse_aggregation_keys(
    value: &Value,
    config: &EngineConfig,
) -> Result<AggregationKeys, MeasurementError> {
    let object = value.as_object().ok_or_else(|| {
        MeasurementError::Parse("aggregation_keys must be an object".to_string())
    })?;
    if object.len() > config.max_aggregation_keys_per_source {
        return Err(MeasurementError::Validation(format!(
            "more than {} aggregation keys",
            config.max_aggregation_keys_per_source
        )));
    }
    object
        .iter()
        .map(|(id, piece)| {
            if id.is_empty() || id.len() > MAX_KEY_ID_LENGTH {
                return Err(MeasurementError::Validation(format!("bad aggregation key id {id}")));
            }
            let piece = piece.as_str().ok_or_else(|| {
                MeasurementError::Parse(format!("aggregation key {id} must be a string"))
            })?;
            Ok((id.clone(), parse_key_piece(piece)?))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XNetworkData {
    pub key_offset: u128,
}

/// One entry of a trigger's `aggregatable_trigger_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatableTriggerData {
    pub key_piece: u128,
    pub source_keys: Vec<String>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
    pub x_network_data: Option<XNetworkData>,
}

impl AggregatableTriggerData {
    pub fn parse(value: &Value, config: &EngineConfig) -> Result<Self, MeasurementError> {
        let object = value.as_object().ok_or_else(|| {
            MeasurementError::Parse("aggregatable_trigger_data entry must be an object".to_string())
        })?;
        let key_piece = object
            .get("key_piece")
            .and_then(Value::as_str)
            .ok_or_else(|| MeasurementError::Parse("key_piece is required".to_string()))?;
        let source_keys = match object.get("source_keys") {
            None => vec![],
            Some(keys) => keys
                .as_array()
                .ok_or_else(|| MeasurementError::Parse("source_keys must be a list".to_string()))?
                .iter()
                .map(|k| {
                    k.as_str().map(str::to_string).ok_or_else(|| {
                        MeasurementError::Parse("source_keys entries must be strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
        };
        let x_network_data = match object.get("x_network_data") {
            Some(data) if config.enable_x_network => {
                let offset = data
                    .get("key_offset")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        MeasurementError::Parse("x_network_data lacks key_offset".to_string())
                    })?;
                Some(XNetworkData {
                    key_offset: parse_key_piece(offset)?,
                })
            }
            _ => None,
        };
        Ok(Self {
            key_piece: parse_key_piece(key_piece)?,
            source_keys,
            filters: optional_filter_set(object.get("filters"), config)?,
            not_filters: optional_filter_set(object.get("not_filters"), config)?,
            x_network_data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatableValue {
    pub value: u64,
    pub filtering_id: Option<u64>,
}

/// A set of per-key values, selected when its filters match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatableValuesConfig {
    pub values: BTreeMap<String, AggregatableValue>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
}

/// Parses `aggregatable_values`, either a plain `{key: value}` map or a list
/// of `{values, filters, not_filters}` entries.
pub fn parse_aggregatable_values(
    value: &Value,
    config: &EngineConfig,
) -> Result<Vec<AggregatableValuesConfig>, MeasurementError> {
    match value {
        Value::Object(_) => Ok(vec![AggregatableValuesConfig {
            values: parse_value_map(value)?,
            filters: vec![],
            not_filters: vec![],
        }]),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| {
                let values = entry.get("values").ok_or_else(|| {
                    MeasurementError::Parse("aggregatable_values entry lacks values".to_string())
                })?;
                Ok(AggregatableValuesConfig {
                    values: parse_value_map(values)?,
                    filters: optional_filter_set(entry.get("filters"), config)?,
                    not_filters: optional_filter_set(entry.get("not_filters"), config)?,
                })
            })
            .collect(),
        _ => Err(MeasurementError::Parse(
            "aggregatable_values must be an object or a list".to_string(),
        )),
    }
}

fn parse_value_map(value: &Value) -> Result<BTreeMap<String, AggregatableValue>, MeasurementError> {
    let object = value.as_object().ok_or_else(|| {
        MeasurementError::Parse("aggregatable values must be an object".to_string())
    })?;
    object
        .iter()
        .map(|(key, raw)| {
            let (value, filtering_id) = match raw {
                Value::Object(inner) => {
                    let value = inner.get("value").ok_or_else(|| {
                        MeasurementError::Parse(format!("value for {key} is missing"))
                    })?;
                    let filtering_id = inner
                        .get("filtering_id")
                        .map(|id| json_u64(id, "filtering_id"))
                        .transpose()?;
                    (json_u64(value, "value")?, filtering_id)
                }
                other => (json_u64(other, "value")?, None),
            };
            if value == 0 || value > MAX_AGGREGATABLE_VALUE {
                return Err(MeasurementError::Validation(format!(
                    "aggregatable value for {key} must be in [1, {MAX_AGGREGATABLE_VALUE}]"
                )));
            }
            Ok((key.clone(), AggregatableValue { value, filtering_id }))
        })
        .collect()
}

/// One entry of `aggregatable_deduplication_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDeduplicationKey {
    pub deduplication_key: Option<u64>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
}

impl AggregateDeduplicationKey {
    pub fn parse(value: &Value, config: &EngineConfig) -> Result<Self, MeasurementError> {
        Ok(Self {
            deduplication_key: value
                .get("deduplication_key")
                .map(|k| json_u64(k, "deduplication_key"))
                .transpose()?,
            filters: optional_filter_set(value.get("filters"), config)?,
            not_filters: optional_filter_set(value.get("not_filters"), config)?,
        })
    }
}

/// Picks the source named budget a trigger's contributions draw from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBudgetSelector {
    pub name: Option<String>,
    pub filters: FilterSet,
    pub not_filters: FilterSet,
}

impl NamedBudgetSelector {
    pub fn parse(value: &Value, config: &EngineConfig) -> Result<Self, MeasurementError> {
        let name = match value.get("name") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(_) => {
                return Err(MeasurementError::Parse(
                    "named budget name must be a string".to_string(),
                ))
            }
        };
        Ok(Self {
            name,
            filters: optional_filter_set(value.get("filters"), config)?,
            not_filters: optional_filter_set(value.get("not_filters"), config)?,
        })
    }
}

pub(crate) fn optional_filter_set(
    value: Option<&Value>,
    config: &EngineConfig,
) -> Result<FilterSet, MeasurementError> {
    match value {
        None | Some(Value::Null) => Ok(vec![]),
        Some(v) => parse_filter_set(v, config.max_filter_maps_per_filter_set),
    }
}
