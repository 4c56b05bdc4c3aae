use log::{debug, info, warn};
use rand::Rng;

use super::quotas::{DenialReason, RateLimitCapacities, RateLimitId};
use crate::{
    budget::traits::FilterCapacities,
    config::EngineConfig,
    error::MeasurementError,
    events::{
        filters::FilterMatcher,
        source::Source,
        traits::{site_of, AttributionMode, Timestamp, TriggerStatus},
        trigger::Trigger,
    },
    mechanisms::{
        noise::{assign_attribution_mode, NoiseOutcome},
        privacy_params::PrivacyParamsCalculator,
    },
    reports::{
        aggregate_report::{AggregateReportBuilder, AggregateReportOutcome},
        debug_report::{DebugReport, DebugReportType},
        event_report::{EventDropReason, EventReportBuilder, EventReportOutcome},
    },
    storage::traits::{Attribution, MeasurementDao},
};

/// Final decision taken for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionOutcome {
    /// The trigger was attributed to `source_id`. A noised source yields
    /// no event reports of its own.
    Attributed {
        source_id: String,
        event_reports: usize,
        aggregate_reports: usize,
    },

    /// Every dedup key the trigger matched was already used by the source.
    /// The trigger is marked attributed with no new report.
    Deduplicated { source_id: String },

    Ignored(DenialReason),

    /// The trigger had already left the pending state.
    AlreadyProcessed(TriggerStatus),
}

/// What the event side of an attribution produced.
#[derive(Debug)]
enum EventSide {
    Created(usize),
    Deduplicated,
    Noised,
    Dropped,
    StorageLimit,
}

/// What the aggregate side of an attribution produced.
#[derive(Debug)]
enum AggregateSide {
    Created,
    Deduplicated,
    Dropped,
    StorageLimit,
}

/// Combined result of both report builders.
#[derive(Debug)]
enum Decision {
    Attributed {
        event_reports: usize,
        aggregate_reports: usize,
    },
    Deduplicated,
    Denied(DenialReason),
}

impl Decision {
    fn from_sides(event_side: &EventSide, aggregate_side: &AggregateSide) -> Self {
        let aggregate_reports = usize::from(matches!(aggregate_side, AggregateSide::Created));
        match (event_side, aggregate_side) {
            (EventSide::Created(n), _) => Decision::Attributed {
                event_reports: *n,
                aggregate_reports,
            },
            (_, AggregateSide::Created) | (EventSide::Noised, _) => Decision::Attributed {
                event_reports: 0,
                aggregate_reports,
            },
            (EventSide::Deduplicated, _) | (_, AggregateSide::Deduplicated) => {
                Decision::Deduplicated
            }
            (EventSide::StorageLimit, _) => Decision::Denied(DenialReason::EventStorageLimit),
            (_, AggregateSide::StorageLimit) => {
                Decision::Denied(DenialReason::AggregateStorageLimit)
            }
            _ => Decision::Denied(DenialReason::NoReportGenerated),
        }
    }
}

/// Matches a pending trigger with its best source and writes the resulting
/// reports. Runs inside the caller's transaction: any `Err` leaves the
/// trigger pending once the transaction is rolled back.
pub struct AttributionCore<'a> {
    config: &'a EngineConfig,
    capacities: RateLimitCapacities,
}

impl<'a> AttributionCore<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            capacities: RateLimitCapacities::from_config(config),
        }
    }

    pub fn attribute<D, R>(
        &self,
        dao: &mut D,
        trigger_id: &str,
        rng: &mut R,
    ) -> Result<AttributionOutcome, MeasurementError>
    where
        D: MeasurementDao + ?Sized,
        R: Rng + ?Sized,
    {
        let Some(mut trigger) = dao.get_trigger(trigger_id)? else {
            return Err(MeasurementError::Validation(format!(
                "Unknown trigger {trigger_id}"
            )));
        };
        if !trigger.is_pending() {
            debug!("Trigger {trigger_id} already {:?}", trigger.status);
            return Ok(AttributionOutcome::AlreadyProcessed(trigger.status));
        }

        let candidates = self.candidates(dao, &trigger)?;
        if candidates.is_empty() {
            return self.ignore(dao, &mut trigger, None, DenialReason::NoMatchingSource);
        }
        let Some(mut source) = candidates
            .into_iter()
            .find(|source| self.trigger_filters_match(source, &trigger))
        else {
            return self.ignore(dao, &mut trigger, None, DenialReason::NoMatchingFilterData);
        };
        debug!("Trigger {} matched source {}", trigger.id, source.id);

        if let Some(reason) = self.check_rate_limits(dao, &source, &trigger)? {
            return self.ignore(dao, &mut trigger, Some(&source), reason);
        }

        let mut debug_reports = vec![];
        self.assign_mode(dao, &mut source, &mut debug_reports, rng)?;

        let event_side = self.build_event_reports(dao, &mut source, &trigger, &mut debug_reports)?;
        let aggregate_side =
            self.build_aggregate_report(dao, &mut source, &trigger, &mut debug_reports, rng)?;

        let decision = Decision::from_sides(&event_side, &aggregate_side);

        dao.update_source(&source)?;
        for report in debug_reports {
            dao.insert_debug_report(report)?;
        }

        match decision {
            Decision::Attributed {
                event_reports,
                aggregate_reports,
            } => {
                dao.insert_attribution(Attribution {
                    source_id: source.id.clone(),
                    trigger_id: trigger.id.clone(),
                    source_site: site_of(&source.publisher),
                    destination_site: site_of(&trigger.attribution_destination),
                    enrollment_id: trigger.enrollment_id.clone(),
                    registration_origin: trigger.registration_origin.clone(),
                    trigger_time: trigger.trigger_time,
                })?;
                trigger.status = TriggerStatus::Attributed;
                dao.update_trigger(&trigger)?;
                info!(
                    "Trigger {} attributed to source {} ({event_reports} event, {aggregate_reports} aggregate reports)",
                    trigger.id, source.id
                );
                Ok(AttributionOutcome::Attributed {
                    source_id: source.id,
                    event_reports,
                    aggregate_reports,
                })
            }
            Decision::Deduplicated => {
                trigger.status = TriggerStatus::Attributed;
                dao.update_trigger(&trigger)?;
                info!("Trigger {} deduplicated against source {}", trigger.id, source.id);
                Ok(AttributionOutcome::Deduplicated {
                    source_id: source.id,
                })
            }
            Decision::Denied(reason) => self.ignore(dao, &mut trigger, Some(&source), reason),
        }
    }

    /// Eligible sources, best first: highest priority, then most recent.
    fn candidates<D: MeasurementDao + ?Sized>(
        &self,
        dao: &D,
        trigger: &Trigger,
    ) -> Result<Vec<Source>, MeasurementError> {
        let mut sources = dao.matching_sources(
            &trigger.attribution_destination,
            trigger.destination_type,
            &trigger.enrollment_id,
            trigger.trigger_time,
        )?;
        if self.config.enable_attribution_scopes && !trigger.attribution_scopes.is_empty() {
            sources.retain(|source| {
                source.attribution_scopes.as_ref().is_some_and(|scopes| {
                    scopes
                        .scopes
                        .iter()
                        .any(|scope| trigger.attribution_scopes.contains(scope))
                })
            });
        }
        sources.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.event_time.cmp(&a.event_time))
        });
        Ok(sources)
    }

    fn trigger_filters_match(&self, source: &Source, trigger: &Trigger) -> bool {
        FilterMatcher::new(
            source.event_time,
            trigger.trigger_time,
            self.config.enable_lookback_window_filter,
        )
        .matches(
            &source.effective_filter_data(),
            &trigger.filters,
            &trigger.not_filters,
        )
    }

    fn rate_limit_start(&self, trigger: &Trigger) -> Timestamp {
        trigger.trigger_time.saturating_sub(self.config.rate_limit_window)
    }

    fn check_rate_limits<D: MeasurementDao + ?Sized>(
        &self,
        dao: &D,
        source: &Source,
        trigger: &Trigger,
    ) -> Result<Option<DenialReason>, MeasurementError> {
        let source_site = site_of(&source.publisher);
        let destination_site = site_of(&trigger.attribution_destination);
        let since = self.rate_limit_start(trigger);

        let limit_id = RateLimitId::Attributions {
            source_site: source_site.clone(),
            destination_site: destination_site.clone(),
            enrollment_id: trigger.enrollment_id.clone(),
        };
        let attributions = dao.count_attributions(
            &source_site,
            &destination_site,
            &trigger.enrollment_id,
            since,
        )? as u64;
        if attributions >= self.capacities.capacity(&limit_id)? {
            warn!("Rate limit {limit_id} reached for trigger {}", trigger.id);
            return Ok(Some(DenialReason::AttributionsPerSourceDestinationLimit));
        }

        let limit_id = RateLimitId::ReportingOrigins {
            source_site: source_site.clone(),
            destination_site: destination_site.clone(),
        };
        let origins = dao.attribution_reporting_origins(&source_site, &destination_site, since)?;
        if !origins.contains(&trigger.registration_origin)
            && origins.len() as u64 >= self.capacities.capacity(&limit_id)?
        {
            warn!("Rate limit {limit_id} reached for trigger {}", trigger.id);
            return Ok(Some(DenialReason::ReportingOriginLimit));
        }
        Ok(None)
    }

    /// Draws the attribution mode the first time a source is used, writing
    /// the fabricated reports of a noised source.
    fn assign_mode<D, R>(
        &self,
        dao: &mut D,
        source: &mut Source,
        debug_reports: &mut Vec<DebugReport>,
        rng: &mut R,
    ) -> Result<(), MeasurementError>
    where
        D: MeasurementDao + ?Sized,
        R: Rng + ?Sized,
    {
        if source.attribution_mode != AttributionMode::Unassigned {
            return Ok(());
        }
        let state_space = PrivacyParamsCalculator::new(self.config)
            .state_space(&source.report_config, source.destination_multiplier());
        if let Some(NoiseOutcome::Fake(fakes)) = assign_attribution_mode(source, &state_space, rng)
        {
            for report in EventReportBuilder::new(self.config).fake_reports(source, &fakes) {
                dao.insert_event_report(report)?;
            }
            debug_reports.extend(DebugReport::for_source(
                source,
                DebugReportType::SourceNoised,
                None,
            ));
        }
        Ok(())
    }

    fn build_event_reports<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        source: &mut Source,
        trigger: &Trigger,
        debug_reports: &mut Vec<DebugReport>,
    ) -> Result<EventSide, MeasurementError> {
        if trigger.event_triggers.is_empty() {
            return Ok(EventSide::Dropped);
        }
        let destination = &trigger.attribution_destination;
        let limit_id = RateLimitId::EventReports(destination.clone());
        if dao.count_event_reports_for_destination(destination)? as u64
            >= self.capacities.capacity(&limit_id)?
        {
            warn!("Rate limit {limit_id} reached for trigger {}", trigger.id);
            return Ok(EventSide::StorageLimit);
        }

        let existing = dao.event_reports_for_source(&source.id)?;
        let side = match EventReportBuilder::new(self.config).build(source, trigger, &existing) {
            EventReportOutcome::Reports {
                created,
                superseded,
            } => {
                for report_id in &superseded {
                    dao.delete_event_report(report_id)?;
                }
                let count = created.len();
                for report in created {
                    dao.insert_event_report(report)?;
                }
                EventSide::Created(count)
            }
            EventReportOutcome::Deduplicated => {
                debug_reports.extend(DebugReport::for_trigger(
                    Some(&*source),
                    trigger,
                    DebugReportType::TriggerEventDeduplicated,
                    None,
                ));
                EventSide::Deduplicated
            }
            EventReportOutcome::Dropped(reason) => {
                debug!("No event report for trigger {}: {reason:?}", trigger.id);
                debug_reports.extend(DebugReport::for_trigger(
                    Some(&*source),
                    trigger,
                    reason.debug_report_type(),
                    None,
                ));
                match reason {
                    EventDropReason::Noised => EventSide::Noised,
                    _ => EventSide::Dropped,
                }
            }
        };
        Ok(side)
    }

    fn build_aggregate_report<D, R>(
        &self,
        dao: &mut D,
        source: &mut Source,
        trigger: &Trigger,
        debug_reports: &mut Vec<DebugReport>,
        rng: &mut R,
    ) -> Result<AggregateSide, MeasurementError>
    where
        D: MeasurementDao + ?Sized,
        R: Rng + ?Sized,
    {
        if !trigger.has_aggregatable_data() {
            return Ok(AggregateSide::Dropped);
        }
        let destination = &trigger.attribution_destination;
        let limit_id = RateLimitId::AggregateReports(destination.clone());
        if dao.count_aggregate_reports_for_destination(destination)? as u64
            >= self.capacities.capacity(&limit_id)?
        {
            warn!("Rate limit {limit_id} reached for trigger {}", trigger.id);
            return Ok(AggregateSide::StorageLimit);
        }

        let source_reports = dao.count_aggregate_reports_for_source(&source.id)?;
        let outcome =
            AggregateReportBuilder::new(self.config).build(source, trigger, source_reports, rng)?;
        let denials = match &outcome {
            AggregateReportOutcome::Report { denials, .. }
            | AggregateReportOutcome::Dropped { denials, .. } => denials.as_slice(),
            AggregateReportOutcome::Deduplicated => &[],
        };
        for denial in denials {
            debug_reports.extend(DebugReport::for_trigger(
                Some(&*source),
                trigger,
                denial.debug_report_type(),
                Some(denial.value.to_string()),
            ));
        }

        let side = match outcome {
            AggregateReportOutcome::Report { report, .. } => {
                dao.insert_aggregate_report(report)?;
                AggregateSide::Created
            }
            AggregateReportOutcome::Deduplicated => {
                debug_reports.extend(DebugReport::for_trigger(
                    Some(&*source),
                    trigger,
                    DebugReportType::TriggerAggregateDeduplicated,
                    None,
                ));
                AggregateSide::Deduplicated
            }
            AggregateReportOutcome::Dropped { reason, .. } => {
                debug!("No aggregate report for trigger {}: {reason:?}", trigger.id);
                if let Some(report_type) = reason.debug_report_type() {
                    debug_reports.extend(DebugReport::for_trigger(
                        Some(&*source),
                        trigger,
                        report_type,
                        None,
                    ));
                }
                AggregateSide::Dropped
            }
        };
        Ok(side)
    }

    /// Marks `trigger` ignored and records the denial.
    fn ignore<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        trigger: &mut Trigger,
        source: Option<&Source>,
        reason: DenialReason,
    ) -> Result<AttributionOutcome, MeasurementError> {
        warn!("Trigger {} ignored: {reason}", trigger.id);
        trigger.status = TriggerStatus::Ignored;
        dao.update_trigger(trigger)?;
        let limit = match reason {
            DenialReason::AttributionsPerSourceDestinationLimit => {
                Some(self.config.max_attributions_per_rate_limit_window.to_string())
            }
            DenialReason::ReportingOriginLimit => {
                Some(self.config.max_distinct_reporting_origins_in_attribution.to_string())
            }
            DenialReason::EventStorageLimit => {
                Some(self.config.max_event_reports_per_destination.to_string())
            }
            DenialReason::AggregateStorageLimit => {
                Some(self.config.max_aggregate_reports_per_destination.to_string())
            }
            _ => None,
        };
        if let Some(report) = reason
            .debug_report_type()
            .and_then(|report_type| DebugReport::for_trigger(source, trigger, report_type, limit))
        {
            dao.insert_debug_report(report)?;
        }
        Ok(AttributionOutcome::Ignored(reason))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        events::traits::ONE_DAY_MS, storage::hashmap_datastore::MeasurementTables,
    };

    fn attribute(
        config: &EngineConfig,
        tables: &mut MeasurementTables,
        trigger_id: &str,
    ) -> Result<AttributionOutcome, MeasurementError> {
        let mut rng = StdRng::seed_from_u64(3);
        AttributionCore::new(config).attribute(tables, trigger_id, &mut rng)
    }

    #[test]
    fn test_no_matching_source() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let mut trigger = Trigger::mock();
        trigger.debug_reporting = true;
        tables.insert_trigger(trigger)?;

        let outcome = attribute(&config, &mut tables, "trigger-1")?;
        assert_eq!(
            outcome,
            AttributionOutcome::Ignored(DenialReason::NoMatchingSource)
        );
        let stored = tables.get_trigger("trigger-1")?.unwrap();
        assert_eq!(stored.status, TriggerStatus::Ignored);
        let report = tables.debug_reports().next().unwrap();
        assert_eq!(report.report_type, DebugReportType::TriggerNoMatchingSource);
        Ok(())
    }

    #[test]
    fn test_highest_priority_source_wins() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let mut low = Source::mock();
        low.id = "low".to_string();
        low.priority = 1;
        let mut high = Source::mock();
        high.id = "high".to_string();
        high.priority = 5;
        high.event_time -= ONE_DAY_MS / 2;
        tables.insert_source(low)?;
        tables.insert_source(high)?;
        tables.insert_trigger(Trigger::mock())?;

        let outcome = attribute(&config, &mut tables, "trigger-1")?;
        assert_eq!(
            outcome,
            AttributionOutcome::Attributed {
                source_id: "high".to_string(),
                event_reports: 1,
                aggregate_reports: 0,
            }
        );
        assert_eq!(tables.event_reports_for_source("high")?.len(), 1);
        assert!(tables.event_reports_for_source("low")?.is_empty());
        let untouched = tables.get_source("low")?.unwrap();
        assert_eq!(untouched.attribution_mode, AttributionMode::Unassigned);
        assert_eq!(tables.attributions().len(), 1);

        // A processed trigger is left alone.
        let again = attribute(&config, &mut tables, "trigger-1")?;
        assert_eq!(
            again,
            AttributionOutcome::AlreadyProcessed(TriggerStatus::Attributed)
        );
        assert_eq!(tables.event_reports_for_source("high")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_used_dedup_key_attributes_without_reports() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        tables.insert_source(Source::mock())?;
        for id in ["trigger-1", "trigger-2"] {
            let mut trigger = Trigger::mock();
            trigger.id = id.to_string();
            trigger.event_triggers[0].dedup_key = Some(42);
            tables.insert_trigger(trigger)?;
        }

        attribute(&config, &mut tables, "trigger-1")?;
        let outcome = attribute(&config, &mut tables, "trigger-2")?;
        assert_eq!(
            outcome,
            AttributionOutcome::Deduplicated {
                source_id: "source-1".to_string()
            }
        );
        let stored = tables.get_trigger("trigger-2")?.unwrap();
        assert_eq!(stored.status, TriggerStatus::Attributed);
        assert_eq!(tables.event_reports_for_source("source-1")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_filter_mismatch() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let mut source = Source::mock();
        source.filter_data.insert("product", vec!["shoes".to_string()]);
        tables.insert_source(source)?;
        let mut trigger = Trigger::mock();
        let mut filter = crate::events::filters::FilterMap::new();
        filter.insert("product", vec!["hats".to_string()]);
        trigger.filters = vec![filter];
        tables.insert_trigger(trigger)?;

        let outcome = attribute(&config, &mut tables, "trigger-1")?;
        assert_eq!(
            outcome,
            AttributionOutcome::Ignored(DenialReason::NoMatchingFilterData)
        );
        Ok(())
    }

    #[test]
    fn test_reporting_origin_limit() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_distinct_reporting_origins_in_attribution = 1;
        let mut tables = MeasurementTables::default();
        tables.insert_source(Source::mock())?;
        let mut second_source = Source::mock();
        second_source.id = "source-2".to_string();
        second_source.enrollment_id = "enrollment-2".to_string();
        second_source.registration_origin = "https://other-adtech.test".to_string();
        tables.insert_source(second_source)?;

        tables.insert_trigger(Trigger::mock())?;
        let mut other = Trigger::mock();
        other.id = "trigger-2".to_string();
        other.enrollment_id = "enrollment-2".to_string();
        other.registration_origin = "https://other-adtech.test".to_string();
        tables.insert_trigger(other)?;

        assert!(matches!(
            attribute(&config, &mut tables, "trigger-1")?,
            AttributionOutcome::Attributed { .. }
        ));
        assert_eq!(
            attribute(&config, &mut tables, "trigger-2")?,
            AttributionOutcome::Ignored(DenialReason::ReportingOriginLimit)
        );
        Ok(())
    }

    #[test]
    fn test_event_storage_limit() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_event_reports_per_destination = 0;
        let mut tables = MeasurementTables::default();
        tables.insert_source(Source::mock())?;
        tables.insert_trigger(Trigger::mock())?;

        assert_eq!(
            attribute(&config, &mut tables, "trigger-1")?,
            AttributionOutcome::Ignored(DenialReason::EventStorageLimit)
        );
        // The mode is drawn as soon as the source takes part in a decision.
        let source = tables.get_source("source-1")?.unwrap();
        assert_eq!(source.attribution_mode, AttributionMode::Truthfully);
        Ok(())
    }
}
