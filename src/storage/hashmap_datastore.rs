use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Context};
use log::{debug, warn};

use super::traits::{Attribution, Datastore, ExpiredRecords, MeasurementDao};
use crate::{
    error::MeasurementError,
    events::{
        source::Source,
        traits::{site_of, EventSurfaceType, Timestamp, TriggerStatus},
        trigger::Trigger,
    },
    reports::{
        aggregate_report::AggregateReport,
        debug_report::DebugReport,
        event_report::EventReport,
        traits::{Report, ReportStatus},
    },
};

/// In-memory tables. Each transaction works on a clone of them.
#[derive(Debug, Clone, Default)]
pub struct MeasurementTables {
    sources: HashMap<String, Source>,
    triggers: HashMap<String, Trigger>,
    event_reports: HashMap<String, EventReport>,
    aggregate_reports: HashMap<String, AggregateReport>,
    debug_reports: HashMap<String, DebugReport>,
    attributions: Vec<Attribution>,
    next_debug_report_id: u64,
}

impl MeasurementTables {
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.values()
    }

    pub fn event_reports(&self) -> impl Iterator<Item = &EventReport> {
        self.event_reports.values()
    }

    pub fn aggregate_reports(&self) -> impl Iterator<Item = &AggregateReport> {
        self.aggregate_reports.values()
    }

    pub fn debug_reports(&self) -> impl Iterator<Item = &DebugReport> {
        self.debug_reports.values()
    }

    pub fn attributions(&self) -> &[Attribution] {
        &self.attributions
    }
}

fn same_destination(a: &str, b: &str) -> bool {
    a == b || site_of(a) == site_of(b)
}

/// Debug reports past their validity, delivered, or out of retries.
fn is_expired<R: Report>(report: &R, earliest_valid_time: Timestamp, retry_limit: u32) -> bool {
    report.status() == ReportStatus::Delivered
        || report.scheduled_report_time() < earliest_valid_time
        || report.retry_count() >= retry_limit
}

impl MeasurementDao for MeasurementTables {
    fn get_source(&self, source_id: &str) -> Result<Option<Source>, anyhow::Error> {
        Ok(self.sources.get(source_id).cloned())
    }

    fn insert_source(&mut self, source: Source) -> Result<(), anyhow::Error> {
        if self.sources.contains_key(&source.id) {
            return Err(anyhow!("Source {} already exists", source.id));
        }
        self.sources.insert(source.id.clone(), source);
        Ok(())
    }

    fn update_source(&mut self, source: &Source) -> Result<(), anyhow::Error> {
        let stored = self
            .sources
            .get_mut(&source.id)
            .with_context(|| format!("Source {} not found", source.id))?;
        *stored = source.clone();
        Ok(())
    }

    fn matching_sources(
        &self,
        destination: &str,
        surface: EventSurfaceType,
        enrollment_id: &str,
        trigger_time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error> {
        Ok(self
            .sources
            .values()
            .filter(|s| {
                s.enrollment_id == enrollment_id
                    && s.is_active_at(trigger_time)
                    && s.has_destination(destination, surface)
            })
            .cloned()
            .collect())
    }

    fn unexpired_sources_for_publisher(
        &self,
        publisher_site: &str,
        time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error> {
        Ok(self
            .sources
            .values()
            .filter(|s| s.expiry_time > time && site_of(&s.publisher) == publisher_site)
            .cloned()
            .collect())
    }

    fn unexpired_sources_for_destination(
        &self,
        destination: &str,
        surface: EventSurfaceType,
        time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error> {
        Ok(self
            .sources
            .values()
            .filter(|s| s.expiry_time > time && s.has_destination(destination, surface))
            .cloned()
            .collect())
    }

    fn get_trigger(&self, trigger_id: &str) -> Result<Option<Trigger>, anyhow::Error> {
        Ok(self.triggers.get(trigger_id).cloned())
    }

    fn insert_trigger(&mut self, trigger: Trigger) -> Result<(), anyhow::Error> {
        if self.triggers.contains_key(&trigger.id) {
            return Err(anyhow!("Trigger {} already exists", trigger.id));
        }
        self.triggers.insert(trigger.id.clone(), trigger);
        Ok(())
    }

    fn update_trigger(&mut self, trigger: &Trigger) -> Result<(), anyhow::Error> {
        let stored = self
            .triggers
            .get_mut(&trigger.id)
            .with_context(|| format!("Trigger {} not found", trigger.id))?;
        *stored = trigger.clone();
        Ok(())
    }

    fn pending_trigger_ids(&self, limit: usize) -> Result<Vec<String>, anyhow::Error> {
        let mut pending: Vec<&Trigger> = self
            .triggers
            .values()
            .filter(|t| t.status == TriggerStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.trigger_time
                .cmp(&b.trigger_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending.into_iter().take(limit).map(|t| t.id.clone()).collect())
    }

    fn event_reports_for_source(&self, source_id: &str) -> Result<Vec<EventReport>, anyhow::Error> {
        Ok(self
            .event_reports
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect())
    }

    fn insert_event_report(&mut self, report: EventReport) -> Result<(), anyhow::Error> {
        if self.event_reports.contains_key(&report.id) {
            return Err(anyhow!("Event report {} already exists", report.id));
        }
        self.event_reports.insert(report.id.clone(), report);
        Ok(())
    }

    fn delete_event_report(&mut self, report_id: &str) -> Result<(), anyhow::Error> {
        self.event_reports
            .remove(report_id)
            .with_context(|| format!("Event report {report_id} not found"))?;
        Ok(())
    }

    fn count_event_reports_for_destination(
        &self,
        destination: &str,
    ) -> Result<usize, anyhow::Error> {
        Ok(self
            .event_reports
            .values()
            .filter(|r| {
                r.is_pending()
                    && r.attribution_destinations
                        .iter()
                        .any(|d| same_destination(d, destination))
            })
            .count())
    }

    fn insert_aggregate_report(&mut self, report: AggregateReport) -> Result<(), anyhow::Error> {
        if self.aggregate_reports.contains_key(&report.id) {
            return Err(anyhow!("Aggregate report {} already exists", report.id));
        }
        self.aggregate_reports.insert(report.id.clone(), report);
        Ok(())
    }

    fn count_aggregate_reports_for_source(&self, source_id: &str) -> Result<usize, anyhow::Error> {
        Ok(self
            .aggregate_reports
            .values()
            .filter(|r| r.source_id == source_id)
            .count())
    }

    fn count_aggregate_reports_for_destination(
        &self,
        destination: &str,
    ) -> Result<usize, anyhow::Error> {
        Ok(self
            .aggregate_reports
            .values()
            .filter(|r| {
                r.status == ReportStatus::Pending
                    && same_destination(&r.attribution_destination, destination)
            })
            .count())
    }

    fn delete_pending_reports_for_source(
        &mut self,
        source_id: &str,
    ) -> Result<usize, anyhow::Error> {
        let before = self.event_reports.len() + self.aggregate_reports.len();
        self.event_reports
            .retain(|_, r| !(r.source_id == source_id && r.is_pending()));
        self.aggregate_reports
            .retain(|_, r| !(r.source_id == source_id && r.status == ReportStatus::Pending));
        Ok(before - self.event_reports.len() - self.aggregate_reports.len())
    }

    fn insert_debug_report(&mut self, mut report: DebugReport) -> Result<String, anyhow::Error> {
        self.next_debug_report_id += 1;
        report.id = format!("debug-{}", self.next_debug_report_id);
        let id = report.id.clone();
        self.debug_reports.insert(id.clone(), report);
        Ok(id)
    }

    fn insert_attribution(&mut self, attribution: Attribution) -> Result<(), anyhow::Error> {
        self.attributions.push(attribution);
        Ok(())
    }

    fn count_attributions(
        &self,
        source_site: &str,
        destination_site: &str,
        enrollment_id: &str,
        since: Timestamp,
    ) -> Result<usize, anyhow::Error> {
        Ok(self
            .attributions
            .iter()
            .filter(|a| {
                a.source_site == source_site
                    && a.destination_site == destination_site
                    && a.enrollment_id == enrollment_id
                    && a.trigger_time >= since
            })
            .count())
    }

    fn attribution_reporting_origins(
        &self,
        source_site: &str,
        destination_site: &str,
        since: Timestamp,
    ) -> Result<BTreeSet<String>, anyhow::Error> {
        Ok(self
            .attributions
            .iter()
            .filter(|a| {
                a.source_site == source_site
                    && a.destination_site == destination_site
                    && a.trigger_time >= since
            })
            .map(|a| a.registration_origin.clone())
            .collect())
    }

    fn increment_report_retry_count(&mut self, report_id: &str) -> Result<bool, anyhow::Error> {
        if let Some(report) = self.event_reports.get_mut(report_id) {
            report.increment_retry_count();
        } else if let Some(report) = self.aggregate_reports.get_mut(report_id) {
            report.increment_retry_count();
        } else if let Some(report) = self.debug_reports.get_mut(report_id) {
            report.increment_retry_count();
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn delete_expired_records(
        &mut self,
        earliest_valid_time: Timestamp,
        retry_limit: u32,
    ) -> Result<ExpiredRecords, anyhow::Error> {
        let mut expired = ExpiredRecords::default();

        let before = self.sources.len();
        self.sources.retain(|_, s| s.event_time >= earliest_valid_time);
        expired.sources = before - self.sources.len();

        let before = self.triggers.len();
        self.triggers.retain(|_, t| t.trigger_time >= earliest_valid_time);
        expired.triggers = before - self.triggers.len();

        let before = self.attributions.len();
        self.attributions
            .retain(|a| a.trigger_time >= earliest_valid_time);
        expired.attributions = before - self.attributions.len();

        // Per-source report caps count stored reports, so attribution reports
        // live exactly as long as their source.
        let sources = &self.sources;
        let before = self.event_reports.len();
        self.event_reports
            .retain(|_, r| sources.contains_key(&r.source_id));
        expired.event_reports = before - self.event_reports.len();

        let before = self.aggregate_reports.len();
        self.aggregate_reports
            .retain(|_, r| sources.contains_key(&r.source_id));
        expired.aggregate_reports = before - self.aggregate_reports.len();

        let before = self.debug_reports.len();
        self.debug_reports
            .retain(|_, r| !is_expired(r, earliest_valid_time, retry_limit));
        expired.debug_reports = before - self.debug_reports.len();

        Ok(expired)
    }
}

/// Serializable in-memory datastore. Transactions are serialized behind a
/// mutex and applied by swapping in the modified copy of the tables.
#[derive(Debug, Default)]
pub struct HashMapDatastore {
    tables: Mutex<MeasurementTables>,
    /// Number of upcoming commits to fail, for exercising rollbacks.
    failing_commits: AtomicUsize,
}

impl HashMapDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail after their work has run.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Reads the committed tables.
    pub fn read<T>(&self, f: impl FnOnce(&MeasurementTables) -> T) -> Result<T, anyhow::Error> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| anyhow!("Datastore lock poisoned"))?;
        Ok(f(&tables))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Datastore for HashMapDatastore {
    type Dao = MeasurementTables;

    fn run_in_transaction_with_result<T, F>(&self, work: F) -> Result<T, MeasurementError>
    where
        F: FnOnce(&mut Self::Dao) -> Result<T, MeasurementError>,
    {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow!("Datastore lock poisoned"))?;
        let mut working_copy = tables.clone();

        match work(&mut working_copy) {
            Ok(result) => {
                if self.take_injected_failure() {
                    warn!("Commit failed, rolling back transaction");
                    return Err(MeasurementError::Storage(anyhow!("Injected commit failure")));
                }
                *tables = working_copy;
                debug!("Transaction committed");
                Ok(result)
            }
            Err(err) => {
                warn!("Rolling back transaction: {err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_rollback() -> Result<(), anyhow::Error> {
        let datastore = HashMapDatastore::new();
        datastore.run_in_transaction(|dao| {
            dao.insert_source(Source::mock())?;
            Ok(())
        })?;
        assert_eq!(datastore.read(|t| t.sources().count())?, 1);

        let result = datastore.run_in_transaction(|dao| {
            let mut source = Source::mock();
            source.id = "second".to_string();
            dao.insert_source(source)?;
            Err(MeasurementError::Validation("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(datastore.read(|t| t.sources().count())?, 1);
        Ok(())
    }

    #[test]
    fn test_injected_commit_failure() -> Result<(), anyhow::Error> {
        let datastore = HashMapDatastore::new();
        datastore.fail_next_commits(1);
        let result = datastore.run_in_transaction(|dao| {
            dao.insert_trigger(Trigger::mock())?;
            Ok(())
        });
        assert!(matches!(result, Err(MeasurementError::Storage(_))));
        assert_eq!(datastore.read(|t| t.triggers().count())?, 0);

        datastore.run_in_transaction(|dao| {
            dao.insert_trigger(Trigger::mock())?;
            Ok(())
        })?;
        assert_eq!(datastore.read(|t| t.triggers().count())?, 1);
        Ok(())
    }

    #[test]
    fn test_matching_sources() -> Result<(), anyhow::Error> {
        let mut tables = MeasurementTables::default();
        let source = Source::mock();
        let destination = source.app_destinations[0].clone();
        tables.insert_source(source.clone())?;

        let found = tables.matching_sources(
            &destination,
            EventSurfaceType::App,
            &source.enrollment_id,
            source.event_time + 1,
        )?;
        assert_eq!(found.len(), 1);

        let other_enrollment = tables.matching_sources(
            &destination,
            EventSurfaceType::App,
            "enrollment-other",
            source.event_time + 1,
        )?;
        assert!(other_enrollment.is_empty());

        let expired = tables.matching_sources(
            &destination,
            EventSurfaceType::App,
            &source.enrollment_id,
            source.expiry_time,
        )?;
        assert!(expired.is_empty());
        Ok(())
    }

    #[test]
    fn test_delete_expired_records() -> Result<(), anyhow::Error> {
        let mut tables = MeasurementTables::default();
        let source = Source::mock();
        tables.insert_source(source.clone())?;
        tables.insert_trigger(Trigger::mock())?;
        let debug_id = tables.insert_debug_report(DebugReport {
            id: String::new(),
            report_type: crate::reports::debug_report::DebugReportType::SourceSuccess,
            body: serde_json::json!({}),
            enrollment_id: source.enrollment_id.clone(),
            registration_origin: source.registration_origin.clone(),
            insertion_time: source.event_time + 10,
            status: ReportStatus::Pending,
            retry_count: 0,
        })?;
        assert!(tables.increment_report_retry_count(&debug_id)?);
        assert!(!tables.increment_report_retry_count("missing")?);

        // Nothing is old yet, but the debug report is out of retries.
        let expired = tables.delete_expired_records(source.event_time, 1)?;
        assert_eq!(expired.debug_reports, 1);
        assert_eq!(expired.sources, 0);

        let expired = tables.delete_expired_records(source.expiry_time, 3)?;
        assert_eq!(expired.sources, 1);
        assert_eq!(expired.triggers, 1);
        Ok(())
    }

    #[test]
    fn test_attribution_reports_outlive_delivery() -> Result<(), anyhow::Error> {
        let mut tables = MeasurementTables::default();
        let source = Source::mock();
        tables.insert_source(source.clone())?;

        let mut delivered = EventReport::mock(&source, "t1", source.event_time + 10);
        delivered.status = ReportStatus::Delivered;
        tables.insert_event_report(delivered)?;
        let exhausted = EventReport::mock(&source, "t2", source.event_time + 20);
        let exhausted_id = exhausted.id.clone();
        tables.insert_event_report(exhausted)?;
        assert!(tables.increment_report_retry_count(&exhausted_id)?);

        // Both still count against the source's report cap.
        let expired = tables.delete_expired_records(source.event_time, 1)?;
        assert_eq!(expired.event_reports, 0);
        assert_eq!(tables.event_reports_for_source(&source.id)?.len(), 2);

        let expired = tables.delete_expired_records(source.event_time + 1, 1)?;
        assert_eq!(expired.sources, 1);
        assert_eq!(expired.event_reports, 2);
        assert!(tables.event_reports_for_source(&source.id)?.is_empty());
        Ok(())
    }
}
