use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

use super::quotas::DenialReason;
use crate::{
    config::EngineConfig,
    error::MeasurementError,
    events::{
        source::Source,
        traits::{site_of, DestinationLimitAlgorithm, EventSurfaceType, SourceStatus, Timestamp},
    },
    mechanisms::privacy_params::{PrivacyParamsCalculator, PrivacyValidation},
    reports::debug_report::{DebugReport, DebugReportType},
    storage::traits::MeasurementDao,
};

/// Result of admitting a parsed source.
#[derive(Debug)]
pub enum AdmissionOutcome {
    Admitted {
        source_id: String,
        /// Sources marked for deletion to make room for the new destinations.
        evicted_sources: Vec<String>,
        /// Older sources whose attribution scopes fell out of the limit.
        ignored_sources: Vec<String>,
    },

    /// Nothing but the debug report, if any, was written.
    Rejected(MeasurementError),
}

/// Checks the privacy and destination limits of a new source and stores
/// it, inside the caller's transaction.
pub struct SourceRegistrar<'a> {
    config: &'a EngineConfig,
}

impl<'a> SourceRegistrar<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn admit<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        mut source: Source,
    ) -> Result<AdmissionOutcome, MeasurementError> {
        let (validation, params) = match PrivacyParamsCalculator::new(self.config).validate(&source)
        {
            Ok(result) => result,
            Err(err) => {
                warn!("Source {} rejected: {err}", source.id);
                return self.reject(
                    dao,
                    &source,
                    DebugReportType::SourceChannelCapacityLimit,
                    Some(self.config.max_report_states_per_source.to_string()),
                    err,
                );
            }
        };
        source.privacy_parameters = Some(params);
        if let Some((report_type, limit)) = self.privacy_denial(&source, validation) {
            let err = MeasurementError::InvalidConfiguration(format!(
                "{} for source {}",
                report_type.as_str(),
                source.id
            ));
            return self.reject(dao, &source, report_type, Some(limit), err);
        }

        if let Some(reason) = self.check_destination_rate_limit(dao, &source)? {
            return self.reject_rate_limited(dao, &source, reason);
        }
        if let Some(reason) = self.check_reporting_origins(dao, &source)? {
            return self.reject_rate_limited(dao, &source, reason);
        }
        let evicted_sources = match self.enforce_destination_limit(dao, &source)? {
            Ok(evicted) => evicted,
            Err(reason) => return self.reject_rate_limited(dao, &source, reason),
        };
        let ignored_sources = self.ignore_out_of_scope_sources(dao, &source)?;

        let source_id = source.id.clone();
        let success = DebugReport::for_source(&source, DebugReportType::SourceSuccess, None);
        dao.insert_source(source)?;
        if let Some(report) = success {
            dao.insert_debug_report(report)?;
        }
        info!("Source {source_id} registered");
        Ok(AdmissionOutcome::Admitted {
            source_id,
            evicted_sources,
            ignored_sources,
        })
    }

    fn privacy_denial(
        &self,
        source: &Source,
        validation: PrivacyValidation,
    ) -> Option<(DebugReportType, String)> {
        let dual = source.is_dual_destination();
        match validation {
            PrivacyValidation::Valid => None,
            PrivacyValidation::InvalidInformationGainLimit => Some((
                DebugReportType::SourceChannelCapacityLimit,
                self.config
                    .info_gain_threshold(source.source_type, dual, false)
                    .to_string(),
            )),
            PrivacyValidation::InvalidScopesInformationGainLimit => Some((
                DebugReportType::SourceScopesChannelCapacityLimit,
                self.config
                    .info_gain_threshold(source.source_type, dual, true)
                    .to_string(),
            )),
            PrivacyValidation::InvalidMaxEventStatesLimit => Some((
                DebugReportType::SourceMaxEventStatesLimit,
                source
                    .attribution_scopes
                    .as_ref()
                    .map_or(self.config.default_max_event_states, |s| s.max_event_states)
                    .to_string(),
            )),
        }
    }

    /// Distinct destinations registered from the publisher site in the
    /// recent window, counting the new ones. The registering enrollment's
    /// own count is checked first.
    fn check_destination_rate_limit<D: MeasurementDao + ?Sized>(
        &self,
        dao: &D,
        source: &Source,
    ) -> Result<Option<DenialReason>, MeasurementError> {
        let publisher_site = site_of(&source.publisher);
        let window_start = source
            .event_time
            .saturating_sub(self.config.destination_rate_limit_window);
        let recent: Vec<Source> = dao
            .unexpired_sources_for_publisher(&publisher_site, source.event_time)?
            .into_iter()
            .filter(|s| s.event_time >= window_start && s.event_time <= source.event_time)
            .collect();
        let distinct_destinations = |same_enrollment: bool| {
            let mut destinations: BTreeSet<String> = recent
                .iter()
                .filter(|s| !same_enrollment || s.enrollment_id == source.enrollment_id)
                .flat_map(|s| s.all_destinations().map(|d| site_of(d)))
                .collect();
            destinations.extend(source.all_destinations().map(|d| site_of(d)));
            destinations.len()
        };

        let enrollment_destinations = distinct_destinations(true);
        let enrollment_max = self
            .config
            .max_destinations_per_publisher_x_enrollment_per_rate_limit_window;
        if enrollment_destinations > enrollment_max {
            warn!(
                "Source {} exceeds {} destinations per rate-limit window for enrollment {}",
                source.id, enrollment_max, source.enrollment_id
            );
            return Ok(Some(DenialReason::EnrollmentDestinationRateLimit));
        }
        if distinct_destinations(false)
            > self.config.max_destinations_per_publisher_per_rate_limit_window
        {
            warn!(
                "Source {} exceeds {} destinations per rate-limit window",
                source.id, self.config.max_destinations_per_publisher_per_rate_limit_window
            );
            return Ok(Some(DenialReason::DestinationRateLimit));
        }
        Ok(None)
    }

    /// Reporting origins already registering sources for each
    /// (publisher site, destination).
    fn check_reporting_origins<D: MeasurementDao + ?Sized>(
        &self,
        dao: &D,
        source: &Source,
    ) -> Result<Option<DenialReason>, MeasurementError> {
        let publisher_site = site_of(&source.publisher);
        let existing = dao.unexpired_sources_for_publisher(&publisher_site, source.event_time)?;
        for destination in source.all_destinations() {
            let destination_site = site_of(destination);
            let origins: BTreeSet<&str> = existing
                .iter()
                .filter(|s| s.all_destinations().any(|d| site_of(d) == destination_site))
                .map(|s| s.registration_origin.as_str())
                .collect();
            if !origins.contains(source.registration_origin.as_str())
                && origins.len() >= self.config.max_distinct_reporting_origins_per_publisher_destination
            {
                warn!(
                    "Source {} exceeds the reporting origin limit for {destination_site}",
                    source.id
                );
                return Ok(Some(DenialReason::SourceReportingOriginLimit));
            }
        }
        Ok(None)
    }

    /// Applies the distinct destination limit for the publisher and
    /// enrollment. Returns the evicted source ids, or the denial when the
    /// source cannot be admitted.
    fn enforce_destination_limit<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        source: &Source,
    ) -> Result<Result<Vec<String>, DenialReason>, MeasurementError> {
        let max = self.config.max_distinct_destinations_in_active_source;
        let publisher_site = site_of(&source.publisher);
        let active: Vec<Source> = dao
            .unexpired_sources_for_publisher(&publisher_site, source.event_time)?
            .into_iter()
            .filter(|s| s.status == SourceStatus::Active && s.enrollment_id == source.enrollment_id)
            .collect();

        // Most recent registration time of each destination.
        let mut last_seen: BTreeMap<String, Timestamp> = BTreeMap::new();
        for existing in &active {
            for destination in existing.all_destinations() {
                let seen = last_seen.entry(destination.clone()).or_default();
                *seen = (*seen).max(existing.event_time);
            }
        }
        let new_destinations: Vec<&String> = source
            .all_destinations()
            .filter(|d| !last_seen.contains_key(*d))
            .collect();
        let excess = (last_seen.len() + new_destinations.len()).saturating_sub(max);
        if excess == 0 {
            return Ok(Ok(vec![]));
        }

        match source.destination_limit_algorithm {
            DestinationLimitAlgorithm::Lifo => {
                warn!("Source {} exceeds {max} distinct destinations", source.id);
                Ok(Err(DenialReason::DestinationLimit))
            }
            DestinationLimitAlgorithm::Fifo => {
                // Destinations the new source also uses are never evicted.
                let mut evictable: Vec<(Timestamp, &String)> = last_seen
                    .iter()
                    .filter(|(d, _)| !source.all_destinations().any(|own| own == *d))
                    .map(|(d, t)| (*t, d))
                    .collect();
                if evictable.len() < excess {
                    warn!("Source {} alone exceeds {max} destinations", source.id);
                    return Ok(Err(DenialReason::DestinationLimit));
                }
                evictable.sort();
                let evicted_destinations: BTreeSet<&String> =
                    evictable.into_iter().take(excess).map(|(_, d)| d).collect();

                let mut evicted = vec![];
                for mut old in active {
                    if !old.all_destinations().any(|d| evicted_destinations.contains(d)) {
                        continue;
                    }
                    old.status = SourceStatus::MarkedToDelete;
                    dao.update_source(&old)?;
                    let deleted = dao.delete_pending_reports_for_source(&old.id)?;
                    debug!(
                        "Source {} marked for deletion, {deleted} pending reports dropped",
                        old.id
                    );
                    evicted.push(old.id);
                }
                info!(
                    "Source {} evicted {} sources over the destination limit",
                    source.id,
                    evicted.len()
                );
                Ok(Ok(evicted))
            }
        }
    }

    /// Active sources of the same reporting origin sharing a destination
    /// with `source`, registered no later than it, newest first.
    fn same_origin_sources<D: MeasurementDao + ?Sized>(
        &self,
        dao: &D,
        source: &Source,
    ) -> Result<Vec<Source>, MeasurementError> {
        let mut related: Vec<Source> = vec![];
        for destination in source.all_destinations() {
            let surface = if source.app_destinations.contains(destination) {
                EventSurfaceType::App
            } else {
                EventSurfaceType::Web
            };
            let sharing =
                dao.unexpired_sources_for_destination(destination, surface, source.event_time)?;
            for other in sharing {
                if other.status == SourceStatus::Active
                    && other.registration_origin == source.registration_origin
                    && other.event_time <= source.event_time
                    && !related.iter().any(|r| r.id == other.id)
                {
                    related.push(other);
                }
            }
        }
        related.sort_by(|a, b| b.event_time.cmp(&a.event_time));
        Ok(related)
    }

    /// Reconciles the attribution scopes of older sources of the same
    /// reporting origin and destination with the new source. Returns the
    /// ids of sources now ignored.
    ///
    /// An unscoped source strips the scopes of the older ones. A scoped
    /// source ignores older sources with no scope limit, a smaller one, or
    /// different max event states, then ignores those whose scopes all
    /// fall outside the most recent `limit` scopes.
    fn ignore_out_of_scope_sources<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        source: &Source,
    ) -> Result<Vec<String>, MeasurementError> {
        if !self.config.enable_attribution_scopes {
            return Ok(vec![]);
        }
        let related = self.same_origin_sources(dao, source)?;

        let Some(scopes) = &source.attribution_scopes else {
            for mut other in related {
                if other.attribution_scopes.take().is_some() {
                    dao.update_source(&other)?;
                    debug!("Source {} lost its attribution scopes", other.id);
                }
            }
            return Ok(vec![]);
        };

        let mut ignored = vec![];
        let mut compatible = vec![];
        for mut other in related {
            let incompatible = match &other.attribution_scopes {
                None => true,
                Some(o) => o.limit < scopes.limit || o.max_event_states != scopes.max_event_states,
            };
            if !incompatible {
                compatible.push(other);
                continue;
            }
            // Reports that may stem from triggers after the new source.
            for report in dao.event_reports_for_source(&other.id)? {
                if report.is_pending() && report.trigger_time >= source.event_time {
                    dao.delete_event_report(&report.id)?;
                }
            }
            other.status = SourceStatus::Ignored;
            dao.update_source(&other)?;
            debug!("Source {} ignored, its scope settings are incompatible", other.id);
            ignored.push(other.id);
        }

        // Newest scopes first, the incoming source ahead of everything.
        let mut kept: Vec<&String> = vec![];
        let ordered = scopes.scopes.iter().chain(
            compatible
                .iter()
                .filter_map(|s| s.attribution_scopes.as_ref())
                .flat_map(|s| s.scopes.iter()),
        );
        for scope in ordered {
            if kept.len() as u64 >= scopes.limit {
                break;
            }
            if !kept.contains(&scope) {
                kept.push(scope);
            }
        }
        let kept: BTreeSet<String> = kept.into_iter().cloned().collect();

        for mut other in compatible {
            let in_scope = other
                .attribution_scopes
                .as_ref()
                .is_some_and(|s| s.scopes.iter().any(|scope| kept.contains(scope)));
            if in_scope {
                continue;
            }
            other.status = SourceStatus::Ignored;
            dao.update_source(&other)?;
            debug!("Source {} ignored, its scopes are out of the limit", other.id);
            ignored.push(other.id);
        }
        Ok(ignored)
    }

    fn reject_rate_limited<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        source: &Source,
        reason: DenialReason,
    ) -> Result<AdmissionOutcome, MeasurementError> {
        let limit = match reason {
            DenialReason::DestinationRateLimit => {
                self.config.max_destinations_per_publisher_per_rate_limit_window
            }
            DenialReason::EnrollmentDestinationRateLimit => {
                self.config
                    .max_destinations_per_publisher_x_enrollment_per_rate_limit_window
            }
            DenialReason::SourceReportingOriginLimit => {
                self.config.max_distinct_reporting_origins_per_publisher_destination
            }
            _ => self.config.max_distinct_destinations_in_active_source,
        };
        match reason.debug_report_type() {
            Some(report_type) => self.reject(
                dao,
                source,
                report_type,
                Some(limit.to_string()),
                MeasurementError::RateLimitExceeded(reason),
            ),
            None => Ok(AdmissionOutcome::Rejected(
                MeasurementError::RateLimitExceeded(reason),
            )),
        }
    }

    fn reject<D: MeasurementDao + ?Sized>(
        &self,
        dao: &mut D,
        source: &Source,
        report_type: DebugReportType,
        limit: Option<String>,
        err: MeasurementError,
    ) -> Result<AdmissionOutcome, MeasurementError> {
        if let Some(report) = DebugReport::for_source(source, report_type, limit) {
            dao.insert_debug_report(report)?;
        }
        Ok(AdmissionOutcome::Rejected(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{source::AttributionScopes, traits::ONE_DAY_MS},
        reports::event_report::EventReport,
        storage::hashmap_datastore::MeasurementTables,
    };

    fn source_to(id: &str, destination: &str, event_time: Timestamp) -> Source {
        let mut source = Source::mock();
        source.id = id.to_string();
        source.app_destinations = vec![destination.to_string()];
        source.event_time = event_time;
        source.expiry_time = event_time + 30 * ONE_DAY_MS;
        source.aggregatable_report_window = source.expiry_time;
        source
    }

    fn admitted(outcome: AdmissionOutcome) -> (Vec<String>, Vec<String>) {
        match outcome {
            AdmissionOutcome::Admitted {
                evicted_sources,
                ignored_sources,
                ..
            } => (evicted_sources, ignored_sources),
            AdmissionOutcome::Rejected(err) => panic!("Unexpected rejection: {err}"),
        }
    }

    #[test]
    fn test_admission_stores_privacy_parameters() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let mut source = Source::mock();
        source.debug_reporting = true;
        admitted(SourceRegistrar::new(&config).admit(&mut tables, source)?);

        let stored = tables.get_source("source-1")?.unwrap();
        let params = stored.privacy_parameters.unwrap();
        assert_eq!(params.num_states, 2925);
        assert!(params.information_gain <= config.navigation_info_gain_threshold);
        let report = tables.debug_reports().next().unwrap();
        assert_eq!(report.report_type, DebugReportType::SourceSuccess);
        Ok(())
    }

    #[test]
    fn test_information_gain_rejection() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.navigation_info_gain_threshold = 1.0;
        let mut tables = MeasurementTables::default();
        let mut source = Source::mock();
        source.debug_reporting = true;

        let outcome = SourceRegistrar::new(&config).admit(&mut tables, source)?;
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(MeasurementError::InvalidConfiguration(_))
        ));
        assert!(tables.get_source("source-1")?.is_none());
        let report = tables.debug_reports().next().unwrap();
        assert_eq!(report.report_type, DebugReportType::SourceChannelCapacityLimit);
        Ok(())
    }

    #[test]
    fn test_lifo_rejects_new_destination() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_distinct_destinations_in_active_source = 1;
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, source_to("a", "android-app://com.one", t))?);
        let outcome = registrar.admit(&mut tables, source_to("b", "android-app://com.two", t + 1))?;
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(MeasurementError::RateLimitExceeded(
                DenialReason::DestinationLimit
            ))
        ));
        // Same destination is fine.
        admitted(registrar.admit(&mut tables, source_to("c", "android-app://com.one", t + 2))?);
        Ok(())
    }

    #[test]
    fn test_fifo_evicts_oldest_destination() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_distinct_destinations_in_active_source = 2;
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, source_to("a", "android-app://com.one", t))?);
        admitted(registrar.admit(&mut tables, source_to("b", "android-app://com.two", t + 10))?);
        let mut newest = source_to("c", "android-app://com.three", t + 20);
        newest.destination_limit_algorithm = DestinationLimitAlgorithm::Fifo;
        let (evicted, _) = admitted(registrar.admit(&mut tables, newest)?);

        assert_eq!(evicted, vec!["a".to_string()]);
        let a = tables.get_source("a")?.unwrap();
        assert_eq!(a.status, SourceStatus::MarkedToDelete);
        let b = tables.get_source("b")?.unwrap();
        assert_eq!(b.status, SourceStatus::Active);
        Ok(())
    }

    #[test]
    fn test_destination_rate_limit() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_destinations_per_publisher_per_rate_limit_window = 1;
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, source_to("a", "android-app://com.one", t))?);
        let outcome =
            registrar.admit(&mut tables, source_to("b", "android-app://com.two", t + 1000))?;
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(MeasurementError::RateLimitExceeded(
                DenialReason::DestinationRateLimit
            ))
        ));
        // Outside the window the old destination no longer counts.
        let later = t + config.destination_rate_limit_window + 1;
        admitted(registrar.admit(&mut tables, source_to("c", "android-app://com.two", later))?);
        Ok(())
    }

    #[test]
    fn test_enrollment_destination_rate_limit() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_destinations_per_publisher_x_enrollment_per_rate_limit_window = 1;
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, source_to("a", "android-app://com.one", t))?);
        // Another enrollment on the same publisher has its own count.
        let mut other = source_to("b", "android-app://com.two", t + 1);
        other.enrollment_id = "enrollment-2".to_string();
        admitted(registrar.admit(&mut tables, other)?);

        let mut source = source_to("c", "android-app://com.two", t + 2);
        source.debug_reporting = true;
        let outcome = registrar.admit(&mut tables, source)?;
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(MeasurementError::RateLimitExceeded(
                DenialReason::EnrollmentDestinationRateLimit
            ))
        ));
        let report = tables.debug_reports().next().unwrap();
        assert_eq!(report.report_type, DebugReportType::SourceDestinationRateLimit);
        assert_eq!(report.body["limit"], "1");
        Ok(())
    }

    #[test]
    fn test_reporting_origin_limit() -> Result<(), anyhow::Error> {
        let mut config = EngineConfig::default();
        config.max_distinct_reporting_origins_per_publisher_destination = 1;
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, source_to("a", "android-app://com.one", t))?);
        let mut other = source_to("b", "android-app://com.one", t + 1);
        other.registration_origin = "https://other-adtech.test".to_string();
        other.enrollment_id = "enrollment-2".to_string();
        let outcome = registrar.admit(&mut tables, other)?;
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(MeasurementError::RateLimitExceeded(
                DenialReason::SourceReportingOriginLimit
            ))
        ));
        Ok(())
    }

    #[test]
    fn test_scopes_out_of_limit_are_ignored() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;
        let scoped = |id: &str, scopes: &[&str], time: Timestamp| {
            let mut source = source_to(id, "android-app://com.one", time);
            source.attribution_scopes = Some(AttributionScopes {
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                limit: 2,
                max_event_states: 3,
            });
            source
        };

        admitted(registrar.admit(&mut tables, scoped("a", &["1"], t))?);
        admitted(registrar.admit(&mut tables, scoped("b", &["2"], t + 1))?);
        let (_, ignored) = admitted(registrar.admit(&mut tables, scoped("c", &["3"], t + 2))?);

        assert_eq!(ignored, vec!["a".to_string()]);
        assert_eq!(tables.get_source("a")?.unwrap().status, SourceStatus::Ignored);
        assert_eq!(tables.get_source("b")?.unwrap().status, SourceStatus::Active);
        Ok(())
    }

    fn scoped(
        id: &str,
        scopes: &[&str],
        limit: u64,
        max_event_states: u64,
        time: Timestamp,
    ) -> Source {
        let mut source = source_to(id, "android-app://com.one", time);
        source.attribution_scopes = Some(AttributionScopes {
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            limit,
            max_event_states,
        });
        source
    }

    #[test]
    fn test_larger_scope_limit_ignores_older_sources() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, scoped("a", &["1"], 2, 3, t))?);
        let (_, ignored) = admitted(registrar.admit(&mut tables, scoped("b", &["1"], 4, 3, t + 1))?);

        assert_eq!(ignored, vec!["a".to_string()]);
        assert_eq!(tables.get_source("a")?.unwrap().status, SourceStatus::Ignored);
        assert_eq!(tables.get_source("b")?.unwrap().status, SourceStatus::Active);
        Ok(())
    }

    #[test]
    fn test_event_states_mismatch_drops_later_reports() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        let a = scoped("a", &["1"], 2, 3, t);
        admitted(registrar.admit(&mut tables, a.clone())?);
        tables.insert_event_report(EventReport::mock(&a, "early", t + 5))?;
        tables.insert_event_report(EventReport::mock(&a, "late", t + 20))?;

        let (_, ignored) = admitted(registrar.admit(&mut tables, scoped("b", &["1"], 2, 2, t + 10))?);
        assert_eq!(ignored, vec!["a".to_string()]);
        let remaining: Vec<String> = tables
            .event_reports_for_source("a")?
            .into_iter()
            .filter_map(|r| r.trigger_id)
            .collect();
        assert_eq!(remaining, vec!["early".to_string()]);

        // A smaller limit and the same event states stay compatible.
        let (_, ignored) = admitted(registrar.admit(&mut tables, scoped("c", &["1"], 1, 2, t + 11))?);
        assert!(ignored.is_empty());
        assert_eq!(tables.get_source("b")?.unwrap().status, SourceStatus::Active);
        Ok(())
    }

    #[test]
    fn test_unscoped_source_strips_older_scopes() -> Result<(), anyhow::Error> {
        let config = EngineConfig::default();
        let mut tables = MeasurementTables::default();
        let registrar = SourceRegistrar::new(&config);
        let t = Source::mock().event_time;

        admitted(registrar.admit(&mut tables, scoped("a", &["1"], 2, 3, t))?);
        let mut elsewhere = scoped("b", &["1"], 2, 3, t + 1);
        elsewhere.registration_origin = "https://other-adtech.test".to_string();
        admitted(registrar.admit(&mut tables, elsewhere)?);

        let (_, ignored) = admitted(
            registrar.admit(&mut tables, source_to("c", "android-app://com.one", t + 2))?,
        );
        assert!(ignored.is_empty());
        let a = tables.get_source("a")?.unwrap();
        assert_eq!(a.status, SourceStatus::Active);
        assert!(a.attribution_scopes.is_none());
        assert!(tables.get_source("b")?.unwrap().attribution_scopes.is_some());
        Ok(())
    }
}
