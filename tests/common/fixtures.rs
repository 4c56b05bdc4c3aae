#![allow(unused)] // each test binary uses a subset

use attributionlib::{
    attribution::{aliases::InMemoryMeasurementService, measurement_service::MeasurementService},
    config::EngineConfig,
    events::{
        parsing::{SourceRegistrationContext, TriggerRegistrationContext},
        source::Source,
        traits::{EventSurfaceType, SourceType, Timestamp},
        trigger::Trigger,
    },
    reports::{aggregate_report::AggregateReport, event_report::EventReport},
    storage::hashmap_datastore::HashMapDatastore,
};
use rand::{rngs::StdRng, SeedableRng};

pub const SOURCE_TIME: Timestamp = 1_700_000_000_000;
pub const ADVERTISER: &str = "android-app://com.advertiser";
pub const ADTECH: &str = "https://adtech.test";

pub fn service(config: EngineConfig) -> Result<InMemoryMeasurementService, anyhow::Error> {
    Ok(MeasurementService::new(
        config,
        HashMapDatastore::new(),
        StdRng::seed_from_u64(0),
    )?)
}

pub fn source_ctx(
    id: &str,
    source_type: SourceType,
    event_time: Timestamp,
) -> SourceRegistrationContext {
    SourceRegistrationContext {
        source_id: id.to_string(),
        publisher: "https://news.example".to_string(),
        publisher_type: EventSurfaceType::Web,
        enrollment_id: "enrollment-1".to_string(),
        registration_origin: ADTECH.to_string(),
        source_type,
        event_time,
    }
}

/// Trigger on the advertiser app, `offset` after [`SOURCE_TIME`].
pub fn trigger_ctx(id: &str, offset: Timestamp) -> TriggerRegistrationContext {
    TriggerRegistrationContext {
        trigger_id: id.to_string(),
        destination: ADVERTISER.to_string(),
        destination_type: EventSurfaceType::App,
        enrollment_id: "enrollment-1".to_string(),
        registration_origin: ADTECH.to_string(),
        trigger_time: SOURCE_TIME + offset,
    }
}

pub fn stored_source(
    service: &InMemoryMeasurementService,
    id: &str,
) -> Result<Option<Source>, anyhow::Error> {
    service
        .datastore
        .read(|tables| tables.sources().find(|s| s.id == id).cloned())
}

pub fn stored_trigger(
    service: &InMemoryMeasurementService,
    id: &str,
) -> Result<Option<Trigger>, anyhow::Error> {
    service
        .datastore
        .read(|tables| tables.triggers().find(|t| t.id == id).cloned())
}

pub fn event_reports(
    service: &InMemoryMeasurementService,
) -> Result<Vec<EventReport>, anyhow::Error> {
    service
        .datastore
        .read(|tables| tables.event_reports().cloned().collect())
}

pub fn aggregate_reports(
    service: &InMemoryMeasurementService,
) -> Result<Vec<AggregateReport>, anyhow::Error> {
    service
        .datastore
        .read(|tables| tables.aggregate_reports().cloned().collect())
}
