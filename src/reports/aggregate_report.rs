use std::collections::BTreeMap;

use anyhow::anyhow;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    debug_report::DebugReportType,
    traits::{seconds_string, Report, ReportStatus},
};
use crate::{
    attribution::quotas::{BudgetId, BudgetStatus},
    budget::traits::{Filter, FilterStatus, FilterStorage},
    config::EngineConfig,
    error::MeasurementError,
    events::{
        aggregation::{format_key_piece, AggregationKeys},
        filters::FilterMatcher,
        source::Source,
        traits::{Timestamp, ONE_DAY_MS},
        trigger::Trigger,
    },
};

/// One histogram entry of an aggregatable report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateHistogramContribution {
    pub bucket: u128,
    pub value: u64,
    pub filtering_id: Option<u64>,
}

impl AggregateHistogramContribution {
    pub fn to_json(&self) -> Value {
        let mut entry = json!({
            "bucket": format_key_piece(self.bucket),
            "value": self.value,
        });
        if let Some(id) = self.filtering_id {
            entry["id"] = json!(id.to_string());
        }
        entry
    }
}

/// Ciphertext produced for one aggregation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub key_id: String,
    pub payload: String,
}

/// Encrypts histogram payloads for the aggregation service. The engine only
/// knows the plaintext and the `shared_info` it is bound to.
pub trait PayloadEncrypter {
    type Error;

    fn encrypt(&self, plaintext: &[u8], shared_info: &str) -> Result<EncryptedPayload, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub id: String,
    pub source_id: String,
    pub trigger_id: String,
    pub publisher: String,
    pub attribution_destination: String,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub source_registration_time: Timestamp,
    pub scheduled_report_time: Timestamp,
    pub trigger_time: Timestamp,
    pub source_debug_key: Option<u64>,
    pub trigger_debug_key: Option<u64>,
    pub contributions: Vec<AggregateHistogramContribution>,
    pub aggregation_coordinator_origin: String,
    pub api_version: String,
    /// Both sides set debug keys, so the cleartext payload is attached.
    pub debug_cleartext: bool,
    pub status: ReportStatus,
    pub retry_count: u32,
}

impl AggregateReport {
    pub fn shared_info(&self) -> Value {
        json!({
            "api": "attribution-reporting",
            "attribution_destination": self.attribution_destination,
            "report_id": self.id,
            "reporting_origin": self.registration_origin,
            "scheduled_report_time": seconds_string(self.scheduled_report_time),
            "source_registration_time": seconds_string(
                self.source_registration_time - self.source_registration_time % ONE_DAY_MS
            ),
            "version": self.api_version,
        })
    }

    pub fn histogram(&self) -> Value {
        let data: Vec<Value> = self.contributions.iter().map(|c| c.to_json()).collect();
        json!({ "operation": "histogram", "data": data })
    }

    /// Full report body with the histogram encrypted by `encrypter`.
    pub fn body<E: PayloadEncrypter>(&self, encrypter: &E) -> Result<Value, E::Error> {
        let shared_info = self.shared_info().to_string();
        let plaintext = self.histogram().to_string();
        let encrypted = encrypter.encrypt(plaintext.as_bytes(), &shared_info)?;

        let mut service_payload = json!({
            "payload": encrypted.payload,
            "key_id": encrypted.key_id,
        });
        if self.debug_cleartext {
            service_payload["debug_cleartext_payload"] = json!(plaintext);
        }
        let mut body = json!({
            "shared_info": shared_info,
            "aggregation_service_payloads": [service_payload],
            "aggregation_coordinator_origin": self.aggregation_coordinator_origin,
        });
        if let Some(key) = self.source_debug_key {
            body["source_debug_key"] = json!(key.to_string());
        }
        if let Some(key) = self.trigger_debug_key {
            body["trigger_debug_key"] = json!(key.to_string());
        }
        Ok(body)
    }
}

impl Report for AggregateReport {
    fn report_id(&self) -> &str {
        &self.id
    }

    fn scheduled_report_time(&self) -> Timestamp {
        self.scheduled_report_time
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
        json!({
            "shared_info": self.shared_info(),
            "aggregation_coordinator_origin": self.aggregation_coordinator_origin,
            "histogram": self.histogram(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateDropReason {
    /// The trigger or the source carries no aggregatable data.
    NoAggregatableData,
    ReportWindowPassed,
    ExcessiveReports,
    NoContributions,
}

impl AggregateDropReason {
    /// Debug report for the drop, if the drop is worth reporting.
    pub fn debug_report_type(&self) -> Option<DebugReportType> {
        match self {
            AggregateDropReason::NoAggregatableData => None,
            AggregateDropReason::ReportWindowPassed => {
                Some(DebugReportType::TriggerAggregateReportWindowPassed)
            }
            AggregateDropReason::ExcessiveReports => {
                Some(DebugReportType::TriggerAggregateExcessiveReports)
            }
            AggregateDropReason::NoContributions => {
                Some(DebugReportType::TriggerAggregateNoContributions)
            }
        }
    }
}

/// A contribution dropped for lack of budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetDenial {
    pub bucket: u128,
    pub value: u64,
    pub budgets: Vec<BudgetId>,
}

impl BudgetDenial {
    pub fn debug_report_type(&self) -> DebugReportType {
        if self.budgets.iter().any(|b| matches!(b, BudgetId::Named(_))) {
            DebugReportType::TriggerAggregateInsufficientNamedBudget
        } else {
            DebugReportType::TriggerAggregateInsufficientBudget
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateReportOutcome {
    Report {
        report: AggregateReport,
        denials: Vec<BudgetDenial>,
    },
    Deduplicated,
    Dropped {
        reason: AggregateDropReason,
        denials: Vec<BudgetDenial>,
    },
}

impl AggregateReportOutcome {
    fn dropped(reason: AggregateDropReason) -> Self {
        AggregateReportOutcome::Dropped {
            reason,
            denials: vec![],
        }
    }
}

/// Builds the aggregatable report of one (source, trigger) attribution,
/// charging the source contribution budgets as it goes.
#[derive(Debug, Clone, Copy)]
pub struct AggregateReportBuilder<'a> {
    config: &'a EngineConfig,
}

impl<'a> AggregateReportBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// `source_report_count` is the number of aggregate reports already
    /// stored for `source`.
    pub fn build<R: Rng + ?Sized>(
        &self,
        source: &mut Source,
        trigger: &Trigger,
        source_report_count: usize,
        rng: &mut R,
    ) -> Result<AggregateReportOutcome, MeasurementError> {
        if !trigger.has_aggregatable_data() || source.aggregation_keys.is_empty() {
            return Ok(AggregateReportOutcome::dropped(
                AggregateDropReason::NoAggregatableData,
            ));
        }
        if trigger.trigger_time >= source.aggregatable_report_window {
            return Ok(AggregateReportOutcome::dropped(
                AggregateDropReason::ReportWindowPassed,
            ));
        }
        if source_report_count >= self.config.max_aggregate_reports_per_source {
            return Ok(AggregateReportOutcome::dropped(
                AggregateDropReason::ExcessiveReports,
            ));
        }

        let matcher = FilterMatcher::new(
            source.event_time,
            trigger.trigger_time,
            self.config.enable_lookback_window_filter,
        );
        let filter_data = source.effective_filter_data();

        let dedup_key = trigger
            .aggregatable_dedup_keys
            .iter()
            .find(|k| matcher.matches(&filter_data, &k.filters, &k.not_filters))
            .and_then(|k| k.deduplication_key);
        if let Some(key) = dedup_key {
            if source.aggregate_report_dedup_keys.contains(key) {
                debug!("Aggregate dedup key {key} already used by source {}", source.id);
                return Ok(AggregateReportOutcome::Deduplicated);
            }
        }

        let keys = self.merge_keys(source, trigger, &matcher);

        let Some(values) = trigger
            .aggregatable_values
            .iter()
            .find(|v| matcher.matches(&filter_data, &v.filters, &v.not_filters))
        else {
            return Ok(AggregateReportOutcome::dropped(
                AggregateDropReason::NoContributions,
            ));
        };

        let budget_name = if self.config.enable_named_budgets {
            trigger
                .named_budgets
                .iter()
                .find(|s| matcher.matches(&filter_data, &s.filters, &s.not_filters))
                .and_then(|s| s.name.clone())
        } else {
            None
        };

        let mut merged: BTreeMap<(u128, Option<u64>), u64> = BTreeMap::new();
        let mut denials = vec![];
        for (key_id, value) in &values.values {
            let Some(bucket) = keys.get(key_id).copied() else {
                continue;
            };

            // Two-phase commit over the source and named budgets.
            let check = self.deduct_contribution(source, budget_name.as_deref(), value.value, true)?;
            match check {
                BudgetStatus::Continue => {
                    let consumed =
                        self.deduct_contribution(source, budget_name.as_deref(), value.value, false)?;
                    if consumed != BudgetStatus::Continue {
                        return Err(MeasurementError::Storage(anyhow!(
                            "Contribution reservation failed with {consumed:?} after the check passed"
                        )));
                    }
                    let entry = merged.entry((bucket, value.filtering_id)).or_default();
                    *entry = entry.saturating_add(value.value);
                }
                BudgetStatus::OutOfBudget(budgets) => {
                    warn!(
                        "Dropping contribution of {} to source {}: {budgets:?} exhausted",
                        value.value, source.id
                    );
                    denials.push(BudgetDenial {
                        bucket,
                        value: value.value,
                        budgets,
                    });
                }
            }
        }

        let contributions: Vec<AggregateHistogramContribution> = merged
            .into_iter()
            .filter(|(_, value)| *value > 0)
            .map(|((bucket, filtering_id), value)| AggregateHistogramContribution {
                bucket,
                value,
                filtering_id,
            })
            .collect();
        if contributions.is_empty() {
            return Ok(AggregateReportOutcome::Dropped {
                reason: AggregateDropReason::NoContributions,
                denials,
            });
        }

        if let Some(key) = dedup_key {
            source.aggregate_report_dedup_keys.insert(key);
        }
        let report = self.report(source, trigger, contributions, rng);
        debug!("Built aggregate report {}", report.id);
        Ok(AggregateReportOutcome::Report { report, denials })
    }

    /// Source keys with the matching trigger key pieces ORed in, then the
    /// cross-network offsets added.
    fn merge_keys(&self, source: &Source, trigger: &Trigger, matcher: &FilterMatcher) -> AggregationKeys {
        let filter_data = source.effective_filter_data();
        let mut keys = source.aggregation_keys.clone();
        let mut offsets: BTreeMap<&str, u128> = BTreeMap::new();
        for data in &trigger.aggregatable_trigger_data {
            if !matcher.matches(&filter_data, &data.filters, &data.not_filters) {
                continue;
            }
            for key_id in &data.source_keys {
                let Some(key) = keys.get_mut(key_id) else {
                    continue;
                };
                *key |= data.key_piece;
                if let Some(x_network) = &data.x_network_data {
                    let offset = offsets.entry(key_id.as_str()).or_default();
                    *offset = offset.wrapping_add(x_network.key_offset);
                }
            }
        }
        for (key_id, offset) in offsets {
            if let Some(key) = keys.get_mut(key_id) {
                *key = key.wrapping_add(offset);
            }
        }
        keys
    }

    /// Charges (or only checks, on `dry_run`) `value` against the source cap
    /// and the named budget, if the source declares it.
    fn deduct_contribution(
        &self,
        source: &mut Source,
        budget_name: Option<&str>,
        value: u64,
        dry_run: bool,
    ) -> Result<BudgetStatus<BudgetId>, anyhow::Error> {
        let mut exhausted = vec![];

        let status = match dry_run {
            true => source.aggregate_contributions.can_consume(&value)?,
            false => source.aggregate_contributions.try_consume(&value)?,
        };
        if status == FilterStatus::OutOfBudget {
            exhausted.push(BudgetId::Source);
        }

        if let (Some(name), Some(budgets)) = (budget_name, source.named_budgets.as_mut()) {
            if budgets.contains(name) {
                let name = name.to_string();
                let status = match dry_run {
                    true => budgets.can_consume(&name, &value)?,
                    false => budgets.try_consume(&name, &value)?,
                };
                if status == FilterStatus::OutOfBudget {
                    exhausted.push(BudgetId::Named(name));
                }
            }
        }

        if !exhausted.is_empty() {
            return Ok(BudgetStatus::OutOfBudget(exhausted));
        }
        Ok(BudgetStatus::Continue)
    }

    fn report<R: Rng + ?Sized>(
        &self,
        source: &Source,
        trigger: &Trigger,
        contributions: Vec<AggregateHistogramContribution>,
        rng: &mut R,
    ) -> AggregateReport {
        let min_delay = self.config.min_aggregate_report_delay;
        let max_delay = self.config.max_aggregate_report_delay;
        let delay = if max_delay > min_delay {
            rng.gen_range(min_delay..max_delay)
        } else {
            min_delay
        };
        let debug_cleartext = source.debug_key.is_some() && trigger.debug_key.is_some();
        AggregateReport {
            id: format!("{}-{}-aggregate", source.id, trigger.id),
            source_id: source.id.clone(),
            trigger_id: trigger.id.clone(),
            publisher: source.publisher.clone(),
            attribution_destination: trigger.attribution_destination.clone(),
            enrollment_id: source.enrollment_id.clone(),
            registration_origin: trigger.registration_origin.clone(),
            source_registration_time: source.event_time,
            scheduled_report_time: trigger.trigger_time + delay,
            trigger_time: trigger.trigger_time,
            source_debug_key: source.debug_key.filter(|_| debug_cleartext),
            trigger_debug_key: trigger.debug_key.filter(|_| debug_cleartext),
            contributions,
            aggregation_coordinator_origin: trigger
                .aggregation_coordinator_origin
                .clone()
                .unwrap_or_else(|| self.config.default_aggregation_coordinator_origin.clone()),
            api_version: self.config.aggregate_api_version.clone(),
            debug_cleartext,
            status: ReportStatus::Pending,
            retry_count: 0,
        }
    }
}
