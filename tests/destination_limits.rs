mod common;

use attributionlib::{
    attribution::quotas::DenialReason,
    config::EngineConfig,
    error::MeasurementError,
    events::traits::{SourceStatus, SourceType, ONE_HOUR_MS},
    reports::debug_report::DebugReportType,
};
use common::{fixtures::*, logging};

fn source_json(destination: &str, algorithm: &str) -> String {
    format!(
        r#"{{
            "destination": "{destination}",
            "destination_limit_algorithm": "{algorithm}",
            "debug_reporting": true
        }}"#
    )
}

fn limited_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.max_distinct_destinations_in_active_source = 2;
    config
}

#[test]
fn lifo_rejects_the_new_source() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(limited_config())?;
    service.register_source(
        &source_json(ADVERTISER, "LIFO"),
        &source_ctx("s1", SourceType::Event, SOURCE_TIME),
    )?;
    service.register_source(
        &source_json("android-app://com.two", "LIFO"),
        &source_ctx("s2", SourceType::Event, SOURCE_TIME + ONE_HOUR_MS),
    )?;

    let result = service.register_source(
        &source_json("android-app://com.three", "LIFO"),
        &source_ctx("s3", SourceType::Event, SOURCE_TIME + 2 * ONE_HOUR_MS),
    );
    assert!(matches!(
        result,
        Err(MeasurementError::RateLimitExceeded(
            DenialReason::DestinationLimit
        ))
    ));
    assert!(stored_source(&service, "s3")?.is_none());

    // The rejection still leaves its debug report behind.
    let limits: Vec<String> = service.datastore.read(|tables| {
        tables
            .debug_reports()
            .filter(|r| r.report_type == DebugReportType::SourceDestinationLimit)
            .map(|r| r.body["limit"].as_str().unwrap_or_default().to_string())
            .collect()
    })?;
    assert_eq!(limits, vec!["2".to_string()]);

    // A known destination does not count against the limit.
    service.register_source(
        &source_json(ADVERTISER, "LIFO"),
        &source_ctx("s4", SourceType::Event, SOURCE_TIME + 3 * ONE_HOUR_MS),
    )?;
    Ok(())
}

#[test]
fn fifo_evicts_the_oldest_destination() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(limited_config())?;
    service.register_source(
        &source_json(ADVERTISER, "FIFO"),
        &source_ctx("s1", SourceType::Event, SOURCE_TIME),
    )?;
    service.register_trigger(
        r#"{"event_trigger_data": [{"trigger_data": "1"}]}"#,
        &trigger_ctx("t1", ONE_HOUR_MS),
    )?;
    service.attribute_trigger("t1")?;
    assert_eq!(event_reports(&service)?.len(), 1);

    service.register_source(
        &source_json("android-app://com.two", "FIFO"),
        &source_ctx("s2", SourceType::Event, SOURCE_TIME + 2 * ONE_HOUR_MS),
    )?;
    service.register_source(
        &source_json("android-app://com.three", "FIFO"),
        &source_ctx("s3", SourceType::Event, SOURCE_TIME + 3 * ONE_HOUR_MS),
    )?;

    let s1 = stored_source(&service, "s1")?.unwrap();
    assert_eq!(s1.status, SourceStatus::MarkedToDelete);
    let s2 = stored_source(&service, "s2")?.unwrap();
    assert_eq!(s2.status, SourceStatus::Active);
    assert!(stored_source(&service, "s3")?.is_some());
    // Pending reports of the evicted source are dropped with it.
    assert!(event_reports(&service)?.is_empty());
    Ok(())
}

#[test]
fn destination_rate_limit_spans_the_window() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut config = EngineConfig::default();
    config.max_destinations_per_publisher_per_rate_limit_window = 1;
    let mut service = service(config)?;
    service.register_source(
        &source_json(ADVERTISER, "LIFO"),
        &source_ctx("s1", SourceType::Event, SOURCE_TIME),
    )?;

    let result = service.register_source(
        &source_json("android-app://com.two", "LIFO"),
        &source_ctx("s2", SourceType::Event, SOURCE_TIME + 1000),
    );
    assert!(matches!(
        result,
        Err(MeasurementError::RateLimitExceeded(
            DenialReason::DestinationRateLimit
        ))
    ));

    // Outside the window the publisher may reach a new destination.
    service.register_source(
        &source_json("android-app://com.two", "LIFO"),
        &source_ctx("s3", SourceType::Event, SOURCE_TIME + ONE_HOUR_MS),
    )?;
    Ok(())
}
