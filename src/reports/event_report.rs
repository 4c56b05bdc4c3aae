use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    debug_report::DebugReportType,
    traits::{seconds_string, Report, ReportStatus},
};
use crate::{
    config::EngineConfig,
    events::{
        bounded::{AttributedTrigger, InsertOutcome},
        filters::FilterMatcher,
        source::Source,
        traits::{AttributionMode, EventSurfaceType, SourceType, Timestamp},
        trigger::{EventTrigger, Trigger},
        trigger_specs::{
            LegacyReportConfig, ReportConfig, SummaryOperator, TriggerDataMatching,
            TriggerSpecs,
        },
    },
    mechanisms::noise::FakeReportConfig,
};

/// A queued event-level report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub id: String,
    pub source_id: String,
    pub source_event_id: u64,
    /// `None` for fabricated reports.
    pub trigger_id: Option<String>,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub attribution_destinations: Vec<String>,
    pub source_type: SourceType,
    pub trigger_data: u64,
    pub trigger_priority: i64,
    pub trigger_dedup_key: Option<u64>,
    pub trigger_time: Timestamp,
    pub report_time: Timestamp,
    pub window_index: usize,
    pub trigger_value: u64,
    /// Inclusive value range of the summary bucket, flexible model only.
    pub trigger_summary_bucket: Option<(u64, u64)>,
    pub randomized_trigger_rate: f64,
    pub source_debug_key: Option<u64>,
    pub trigger_debug_key: Option<u64>,
    pub status: ReportStatus,
    pub retry_count: u32,
}

impl EventReport {
    pub fn is_fake(&self) -> bool {
        self.trigger_id.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReportStatus::Pending
    }
}

impl Report for EventReport {
    fn report_id(&self) -> &str {
        &self.id
    }

    fn scheduled_report_time(&self) -> Timestamp {
        self.report_time
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
        let destination = match self.attribution_destinations.as_slice() {
            [single] => json!(single),
            many => json!(many),
        };
        let mut payload = json!({
            "attribution_destination": destination,
            "scheduled_report_time": seconds_string(self.report_time),
            "source_event_id": self.source_event_id.to_string(),
            "trigger_data": self.trigger_data.to_string(),
            "report_id": self.id,
            "source_type": self.source_type.as_str(),
            "randomized_trigger_rate": self.randomized_trigger_rate,
        });
        if let Some((low, high)) = self.trigger_summary_bucket {
            payload["trigger_summary_bucket"] = json!([low, high]);
        }
        if let Some(key) = self.source_debug_key {
            payload["source_debug_key"] = json!(key.to_string());
        }
        if let Some(key) = self.trigger_debug_key {
            payload["trigger_debug_key"] = json!(key.to_string());
        }
        payload
    }
}

/// Why a trigger produced no event-level report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDropReason {
    NoMatchingConfigurations,
    NoMatchingTriggerData,
    ReportWindowPassed,
    ExcessiveReports,
    LowPriority,
    /// The source reports a randomized state instead.
    Noised,
}

impl EventDropReason {
    pub fn debug_report_type(&self) -> DebugReportType {
        match self {
            EventDropReason::NoMatchingConfigurations => {
                DebugReportType::TriggerEventNoMatchingConfigurations
            }
            EventDropReason::NoMatchingTriggerData => {
                DebugReportType::TriggerEventNoMatchingTriggerData
            }
            EventDropReason::ReportWindowPassed => DebugReportType::TriggerEventReportWindowPassed,
            EventDropReason::ExcessiveReports => DebugReportType::TriggerEventExcessiveReports,
            EventDropReason::LowPriority => DebugReportType::TriggerEventLowPriority,
            EventDropReason::Noised => DebugReportType::TriggerEventNoise,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventReportOutcome {
    /// New reports, and the ids of pending reports they supersede.
    Reports {
        created: Vec<EventReport>,
        superseded: Vec<String>,
    },
    Deduplicated,
    Dropped(EventDropReason),
}

/// Builds event-level reports for one (source, trigger) attribution. The
/// builder mutates the dedup and attributed-trigger state of the source,
/// which the caller persists in the same transaction as the reports.
#[derive(Debug, Clone, Copy)]
pub struct EventReportBuilder<'a> {
    config: &'a EngineConfig,
}

impl<'a> EventReportBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// First `event_trigger_data` entry whose filters match the source.
    pub fn select_event_trigger<'t>(
        &self,
        source: &Source,
        trigger: &'t Trigger,
    ) -> Option<&'t EventTrigger> {
        let matcher = FilterMatcher::new(
            source.event_time,
            trigger.trigger_time,
            self.config.enable_lookback_window_filter,
        );
        let filter_data = source.effective_filter_data();
        trigger
            .event_triggers
            .iter()
            .find(|et| matcher.matches(&filter_data, &et.filters, &et.not_filters))
    }

    /// `existing` holds the stored event reports of `source`.
    pub fn build(
        &self,
        source: &mut Source,
        trigger: &Trigger,
        existing: &[EventReport],
    ) -> EventReportOutcome {
        let Some(event_trigger) = self.select_event_trigger(source, trigger) else {
            return EventReportOutcome::Dropped(EventDropReason::NoMatchingConfigurations);
        };
        if source.attribution_mode != AttributionMode::Truthfully {
            return EventReportOutcome::Dropped(EventDropReason::Noised);
        }
        if let Some(key) = event_trigger.dedup_key {
            if source.event_report_dedup_keys.contains(key) {
                debug!("Event dedup key {key} already used by source {}", source.id);
                return EventReportOutcome::Deduplicated;
            }
        }

        let event_trigger = event_trigger.clone();
        let outcome = match &source.report_config {
            ReportConfig::Legacy(legacy) => {
                let legacy = legacy.clone();
                self.build_legacy(source, &legacy, trigger, &event_trigger, existing)
            }
            ReportConfig::Flexible(_) => {
                self.build_flexible(source, trigger, &event_trigger, existing)
            }
        };
        if let (EventReportOutcome::Reports { .. }, Some(key)) = (&outcome, event_trigger.dedup_key)
        {
            source.event_report_dedup_keys.insert(key);
        }
        outcome
    }

    fn build_legacy(
        &self,
        source: &mut Source,
        legacy: &LegacyReportConfig,
        trigger: &Trigger,
        event_trigger: &EventTrigger,
        existing: &[EventReport],
    ) -> EventReportOutcome {
        let trigger_data = match source.trigger_data_matching {
            TriggerDataMatching::Modulus => event_trigger.trigger_data % legacy.cardinality.max(1),
            TriggerDataMatching::Exact if event_trigger.trigger_data < legacy.cardinality => {
                event_trigger.trigger_data
            }
            TriggerDataMatching::Exact => {
                return EventReportOutcome::Dropped(EventDropReason::NoMatchingTriggerData)
            }
        };
        let elapsed = trigger.trigger_time.saturating_sub(source.event_time);
        let window = legacy
            .windows
            .window_index(elapsed)
            .and_then(|i| Some((i, legacy.windows.end(i)?)));
        let Some((window_index, window_end)) = window else {
            return EventReportOutcome::Dropped(EventDropReason::ReportWindowPassed);
        };

        let report = EventReport {
            id: format!("{}-{}", source.id, trigger.id),
            trigger_data,
            trigger_priority: event_trigger.priority,
            trigger_dedup_key: event_trigger.dedup_key,
            trigger_time: trigger.trigger_time,
            report_time: self.report_time(source, window_end),
            window_index,
            trigger_value: 1,
            trigger_summary_bucket: None,
            ..self.report_template(source, trigger)
        };

        let live: Vec<&EventReport> = existing
            .iter()
            .filter(|r| r.source_id == source.id && r.status != ReportStatus::MarkedToDelete)
            .collect();
        if live.len() < legacy.max_reports as usize {
            return EventReportOutcome::Reports {
                created: vec![report],
                superseded: vec![],
            };
        }

        // At the cap: only a pending report of the same window may give way,
        // the lowest priority one and among those the most recent.
        let victim = live
            .iter()
            .filter(|r| r.is_pending() && r.report_time == report.report_time)
            .min_by(|a, b| {
                a.trigger_priority
                    .cmp(&b.trigger_priority)
                    .then_with(|| b.trigger_time.cmp(&a.trigger_time))
            });
        match victim {
            None => EventReportOutcome::Dropped(EventDropReason::ExcessiveReports),
            Some(victim) if victim.trigger_priority >= report.trigger_priority => {
                EventReportOutcome::Dropped(EventDropReason::LowPriority)
            }
            Some(victim) => {
                debug!(
                    "Report {} replaces lower priority report {}",
                    report.id, victim.id
                );
                if let Some(key) = victim.trigger_dedup_key {
                    source.event_report_dedup_keys.remove(key);
                }
                EventReportOutcome::Reports {
                    created: vec![report],
                    superseded: vec![victim.id.clone()],
                }
            }
        }
    }

    fn build_flexible(
        &self,
        source: &mut Source,
        trigger: &Trigger,
        event_trigger: &EventTrigger,
        existing: &[EventReport],
    ) -> EventReportOutcome {
        let matching = source.trigger_data_matching;
        let ReportConfig::Flexible(specs) = &mut source.report_config else {
            return EventReportOutcome::Dropped(EventDropReason::NoMatchingConfigurations);
        };
        let Some(trigger_data) = specs.resolve_trigger_data(event_trigger.trigger_data, matching)
        else {
            return EventReportOutcome::Dropped(EventDropReason::NoMatchingTriggerData);
        };
        let Some(spec) = specs.spec_for(trigger_data) else {
            return EventReportOutcome::Dropped(EventDropReason::NoMatchingTriggerData);
        };
        let elapsed = trigger.trigger_time.saturating_sub(source.event_time);
        let Some(window_index) = spec.windows.window_index(elapsed) else {
            return EventReportOutcome::Dropped(EventDropReason::ReportWindowPassed);
        };
        let value = match spec.summary_operator {
            SummaryOperator::Count => 1,
            SummaryOperator::ValueSum => event_trigger.value,
        };

        let attributed = AttributedTrigger {
            trigger_id: trigger.id.clone(),
            trigger_data,
            value,
            priority: event_trigger.priority,
            trigger_time: trigger.trigger_time,
            dedup_key: event_trigger.dedup_key,
            window_index,
        };
        match specs.attributed_triggers.insert(attributed, window_index) {
            InsertOutcome::Inserted => {}
            InsertOutcome::Replaced(evicted) => {
                debug!(
                    "Trigger {} evicted trigger {} from source {}",
                    trigger.id, evicted.trigger_id, source.id
                );
                if let Some(key) = evicted.dedup_key {
                    source.event_report_dedup_keys.remove(key);
                }
            }
            InsertOutcome::Rejected => {
                return EventReportOutcome::Dropped(EventDropReason::LowPriority);
            }
        }

        let superseded = existing
            .iter()
            .filter(|r| {
                r.source_id == source.id
                    && r.is_pending()
                    && !r.is_fake()
                    && r.window_index >= window_index
            })
            .map(|r| r.id.clone())
            .collect();
        let created = self.summarize(source, trigger, window_index);
        EventReportOutcome::Reports {
            created,
            superseded,
        }
    }

    /// One report per (window, trigger data) from `from_window` on, for each
    /// window in which the running total reaches a higher summary bucket.
    fn summarize(&self, source: &Source, trigger: &Trigger, from_window: usize) -> Vec<EventReport> {
        let ReportConfig::Flexible(specs) = &source.report_config else {
            return vec![];
        };
        let mut by_data: BTreeMap<u64, Vec<&AttributedTrigger>> = BTreeMap::new();
        for entry in specs.attributed_triggers.entries() {
            by_data.entry(entry.trigger_data).or_default().push(entry);
        }

        let mut reports = Vec::new();
        for (trigger_data, entries) in by_data {
            reports.extend(self.summarize_trigger_data(
                source,
                specs,
                trigger,
                trigger_data,
                &entries,
                from_window,
            ));
        }
        reports
    }

    fn summarize_trigger_data(
        &self,
        source: &Source,
        specs: &TriggerSpecs,
        trigger: &Trigger,
        trigger_data: u64,
        entries: &[&AttributedTrigger],
        from_window: usize,
    ) -> Vec<EventReport> {
        let Some(spec) = specs.spec_for(trigger_data) else {
            return vec![];
        };
        let mut reports = Vec::new();
        let mut total: u64 = 0;
        let mut reported_bucket: Option<usize> = None;
        for (window_index, window_end) in spec.windows.ends.iter().enumerate() {
            let in_window: Vec<&&AttributedTrigger> = entries
                .iter()
                .filter(|e| e.window_index == window_index)
                .collect();
            total = in_window.iter().fold(total, |acc, e| acc.saturating_add(e.value));
            let bucket = spec.bucket_index(total);
            if bucket <= reported_bucket {
                continue;
            }
            reported_bucket = bucket;
            let (Some(bucket), Some(last)) = (bucket, in_window.last()) else {
                continue;
            };
            if window_index < from_window {
                continue;
            }
            let priority = in_window.iter().map(|e| e.priority).max().unwrap_or(last.priority);
            reports.push(EventReport {
                id: format!("{}-w{}-d{}", source.id, window_index, trigger_data),
                trigger_id: Some(last.trigger_id.clone()),
                trigger_data,
                trigger_priority: priority,
                trigger_dedup_key: last.dedup_key,
                trigger_time: last.trigger_time,
                report_time: self.report_time(source, *window_end),
                window_index,
                trigger_value: total,
                trigger_summary_bucket: spec.bucket_range(bucket),
                ..self.report_template(source, trigger)
            });
        }
        reports
    }

    /// Reports standing in for the real output of a noised source.
    pub fn fake_reports(&self, source: &Source, fakes: &[FakeReportConfig]) -> Vec<EventReport> {
        fakes
            .iter()
            .enumerate()
            .filter_map(|(n, fake)| {
                let window_end = source
                    .report_config
                    .windows_for(fake.trigger_data)?
                    .end(fake.window_index)?;
                let trigger_summary_bucket = match &source.report_config {
                    ReportConfig::Legacy(_) => None,
                    ReportConfig::Flexible(specs) => specs
                        .spec_for(fake.trigger_data)?
                        .bucket_range(fake.bucket_index),
                };
                let attribution_destinations = if source.is_dual_destination() {
                    let surface = match fake.destination_index {
                        0 => EventSurfaceType::App,
                        _ => EventSurfaceType::Web,
                    };
                    source.destinations(surface).to_vec()
                } else {
                    source.all_destinations().cloned().collect()
                };
                Some(EventReport {
                    id: format!("{}-fake-{n}", source.id),
                    source_id: source.id.clone(),
                    source_event_id: source.event_id,
                    trigger_id: None,
                    enrollment_id: source.enrollment_id.clone(),
                    registration_origin: source.registration_origin.clone(),
                    attribution_destinations,
                    source_type: source.source_type,
                    trigger_data: fake.trigger_data,
                    trigger_priority: 0,
                    trigger_dedup_key: None,
                    trigger_time: source.event_time,
                    report_time: self.report_time(source, window_end),
                    window_index: fake.window_index,
                    trigger_value: 0,
                    trigger_summary_bucket,
                    randomized_trigger_rate: source.flip_probability(),
                    source_debug_key: None,
                    trigger_debug_key: None,
                    status: ReportStatus::Pending,
                    retry_count: 0,
                })
            })
            .collect()
    }

    fn report_time(&self, source: &Source, window_end: Timestamp) -> Timestamp {
        source.event_time + window_end + self.config.event_report_delay
    }

    /// Fields shared by every report of a real attribution.
    fn report_template(&self, source: &Source, trigger: &Trigger) -> EventReport {
        let debug_keys = source.debug_key.is_some() && trigger.debug_key.is_some();
        EventReport {
            id: String::new(),
            source_id: source.id.clone(),
            source_event_id: source.event_id,
            trigger_id: Some(trigger.id.clone()),
            enrollment_id: source.enrollment_id.clone(),
            registration_origin: trigger.registration_origin.clone(),
            attribution_destinations: source.destinations(trigger.destination_type).to_vec(),
            source_type: source.source_type,
            trigger_data: 0,
            trigger_priority: 0,
            trigger_dedup_key: None,
            trigger_time: trigger.trigger_time,
            report_time: 0,
            window_index: 0,
            trigger_value: 0,
            trigger_summary_bucket: None,
            randomized_trigger_rate: source.flip_probability(),
            source_debug_key: source.debug_key.filter(|_| debug_keys),
            trigger_debug_key: trigger.debug_key.filter(|_| debug_keys),
            status: ReportStatus::Pending,
            retry_count: 0,
        }
    }
}
