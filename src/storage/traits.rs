use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::MeasurementError,
    events::{
        source::Source,
        traits::{EventSurfaceType, Timestamp},
        trigger::Trigger,
    },
    reports::{
        aggregate_report::AggregateReport, debug_report::DebugReport, event_report::EventReport,
    },
};

/// One successful attribution, kept for the attribution rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub source_id: String,
    pub trigger_id: String,
    pub source_site: String,
    pub destination_site: String,
    pub enrollment_id: String,
    pub registration_origin: String,
    pub trigger_time: Timestamp,
}

/// Number of records removed by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiredRecords {
    pub sources: usize,
    pub triggers: usize,
    pub attributions: usize,
    pub event_reports: usize,
    pub aggregate_reports: usize,
    pub debug_reports: usize,
}

/// Accessors available inside a transaction. Implementations report
/// failures as `anyhow` errors, which abort the transaction.
pub trait MeasurementDao {
    fn get_source(&self, source_id: &str) -> Result<Option<Source>, anyhow::Error>;

    fn insert_source(&mut self, source: Source) -> Result<(), anyhow::Error>;

    /// Overwrites a stored source. Fails if it does not exist.
    fn update_source(&mut self, source: &Source) -> Result<(), anyhow::Error>;

    /// Active sources of `enrollment_id` reporting to `destination` on
    /// `surface` whose lifetime covers `trigger_time`, in no particular
    /// order.
    fn matching_sources(
        &self,
        destination: &str,
        surface: EventSurfaceType,
        enrollment_id: &str,
        trigger_time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error>;

    /// Sources registered on `publisher_site`, active or not, that have not
    /// expired at `time`.
    fn unexpired_sources_for_publisher(
        &self,
        publisher_site: &str,
        time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error>;

    /// Unexpired sources, of any publisher, that report to `destination`.
    fn unexpired_sources_for_destination(
        &self,
        destination: &str,
        surface: EventSurfaceType,
        time: Timestamp,
    ) -> Result<Vec<Source>, anyhow::Error>;

    fn get_trigger(&self, trigger_id: &str) -> Result<Option<Trigger>, anyhow::Error>;

    fn insert_trigger(&mut self, trigger: Trigger) -> Result<(), anyhow::Error>;

    fn update_trigger(&mut self, trigger: &Trigger) -> Result<(), anyhow::Error>;

    /// Pending trigger ids, oldest first, at most `limit` of them.
    fn pending_trigger_ids(&self, limit: usize) -> Result<Vec<String>, anyhow::Error>;

    fn event_reports_for_source(&self, source_id: &str) -> Result<Vec<EventReport>, anyhow::Error>;

    fn insert_event_report(&mut self, report: EventReport) -> Result<(), anyhow::Error>;

    fn delete_event_report(&mut self, report_id: &str) -> Result<(), anyhow::Error>;

    /// Pending event reports attributed to `destination`.
    fn count_event_reports_for_destination(
        &self,
        destination: &str,
    ) -> Result<usize, anyhow::Error>;

    fn insert_aggregate_report(&mut self, report: AggregateReport) -> Result<(), anyhow::Error>;

    fn count_aggregate_reports_for_source(&self, source_id: &str) -> Result<usize, anyhow::Error>;

    /// Pending aggregate reports attributed to `destination`.
    fn count_aggregate_reports_for_destination(
        &self,
        destination: &str,
    ) -> Result<usize, anyhow::Error>;

    /// Drops every pending event and aggregate report of `source_id`.
    fn delete_pending_reports_for_source(&mut self, source_id: &str)
        -> Result<usize, anyhow::Error>;

    /// Stores `report` and returns the id assigned to it.
    fn insert_debug_report(&mut self, report: DebugReport) -> Result<String, anyhow::Error>;

    fn insert_attribution(&mut self, attribution: Attribution) -> Result<(), anyhow::Error>;

    /// Attributions for (source site, destination site, enrollment) with a
    /// trigger time at or after `since`.
    fn count_attributions(
        &self,
        source_site: &str,
        destination_site: &str,
        enrollment_id: &str,
        since: Timestamp,
    ) -> Result<usize, anyhow::Error>;

    /// Reporting origins attributed for (source site, destination site) at
    /// or after `since`.
    fn attribution_reporting_origins(
        &self,
        source_site: &str,
        destination_site: &str,
        since: Timestamp,
    ) -> Result<BTreeSet<String>, anyhow::Error>;

    /// Increments the retry count of the event, aggregate or debug report
    /// with id `report_id`. Returns false if no such report exists.
    fn increment_report_retry_count(&mut self, report_id: &str) -> Result<bool, anyhow::Error>;

    /// Removes sources, triggers and attributions older than
    /// `earliest_valid_time`, along with the event and aggregate reports of
    /// removed sources. Debug reports go once delivered, scheduled before
    /// `earliest_valid_time`, or retried `retry_limit` times or more.
    fn delete_expired_records(
        &mut self,
        earliest_valid_time: Timestamp,
        retry_limit: u32,
    ) -> Result<ExpiredRecords, anyhow::Error>;
}

/// Transactional access to the measurement tables. A unit of work either
/// commits entirely or leaves storage untouched.
pub trait Datastore {
    type Dao: MeasurementDao;

    /// Runs `work` in one transaction, committing only if it returns `Ok`.
    fn run_in_transaction_with_result<T, F>(&self, work: F) -> Result<T, MeasurementError>
    where
        F: FnOnce(&mut Self::Dao) -> Result<T, MeasurementError>;

    fn run_in_transaction<F>(&self, work: F) -> Result<(), MeasurementError>
    where
        F: FnOnce(&mut Self::Dao) -> Result<(), MeasurementError>,
    {
        self.run_in_transaction_with_result(work)
    }
}

impl<D: Datastore> Datastore for std::sync::Arc<D> {
    type Dao = D::Dao;

    fn run_in_transaction_with_result<T, F>(&self, work: F) -> Result<T, MeasurementError>
    where
        F: FnOnce(&mut Self::Dao) -> Result<T, MeasurementError>,
    {
        self.as_ref().run_in_transaction_with_result(work)
    }
}
