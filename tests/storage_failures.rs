mod common;

use attributionlib::{
    attribution::core::AttributionOutcome,
    config::EngineConfig,
    events::traits::{AttributionMode, SourceType, TriggerStatus, ONE_DAY_MS},
    reports::traits::Report,
};
use common::{fixtures::*, logging};

const SOURCE: &str = r#"{"destination": "android-app://com.advertiser"}"#;
const TRIGGER: &str = r#"{"event_trigger_data": [{"trigger_data": "1"}]}"#;

#[test]
fn failed_commit_leaves_the_trigger_pending() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(EngineConfig::default())?;
    service.register_source(SOURCE, &source_ctx("s1", SourceType::Event, SOURCE_TIME))?;
    service.register_trigger(TRIGGER, &trigger_ctx("t1", ONE_DAY_MS))?;

    service.datastore.fail_next_commits(1);
    let err = service.attribute_trigger("t1").unwrap_err();
    assert!(err.is_retryable());

    let trigger = stored_trigger(&service, "t1")?.unwrap();
    assert_eq!(trigger.status, TriggerStatus::Pending);
    let source = stored_source(&service, "s1")?.unwrap();
    assert_eq!(source.attribution_mode, AttributionMode::Unassigned);
    assert!(event_reports(&service)?.is_empty());

    // The retry sees the same state as the first attempt.
    assert!(matches!(
        service.attribute_trigger("t1")?,
        AttributionOutcome::Attributed { event_reports: 1, .. }
    ));
    let trigger = stored_trigger(&service, "t1")?.unwrap();
    assert_eq!(trigger.status, TriggerStatus::Attributed);
    Ok(())
}

#[test]
fn failed_registration_stores_nothing() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(EngineConfig::default())?;
    service.datastore.fail_next_commits(1);
    let err = service
        .register_source(SOURCE, &source_ctx("s1", SourceType::Event, SOURCE_TIME))
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(stored_source(&service, "s1")?.is_none());

    // Malformed payloads are not worth retrying.
    let err = service
        .register_trigger(r#"{"event_trigger_data": "nope"}"#, &trigger_ctx("t1", 0))
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(stored_trigger(&service, "t1")?.is_none());
    Ok(())
}

#[test]
fn expiry_sweep_and_retries() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(EngineConfig::default())?;
    service.register_source(SOURCE, &source_ctx("s1", SourceType::Event, SOURCE_TIME))?;
    service.register_trigger(TRIGGER, &trigger_ctx("t1", ONE_DAY_MS))?;
    service.attribute_trigger("t1")?;

    let report_id = event_reports(&service)?[0].report_id().to_string();
    assert!(service.increment_report_retry_count(&report_id)?);
    assert!(service.increment_report_retry_count(&report_id)?);
    assert!(!service.increment_report_retry_count("missing")?);
    assert_eq!(event_reports(&service)?[0].retry_count(), 2);

    // The report hit the retry limit but stays while its source is alive.
    let expired = service.delete_expired_records(SOURCE_TIME, 2)?;
    assert_eq!(expired.event_reports, 0);
    assert_eq!(expired.sources, 0);
    assert_eq!(expired.triggers, 0);

    let expired = service.delete_expired_records(SOURCE_TIME + 2 * ONE_DAY_MS, 2)?;
    assert_eq!(expired.sources, 1);
    assert_eq!(expired.triggers, 1);
    assert_eq!(expired.attributions, 1);
    assert_eq!(expired.event_reports, 1);
    assert!(stored_source(&service, "s1")?.is_none());
    assert!(event_reports(&service)?.is_empty());
    Ok(())
}

#[test]
fn sweep_keeps_the_report_cap() -> Result<(), anyhow::Error> {
    logging::init_default_logging();
    let mut service = service(EngineConfig::default())?;
    service.register_source(SOURCE, &source_ctx("s1", SourceType::Event, SOURCE_TIME))?;
    service.register_trigger(TRIGGER, &trigger_ctx("t1", ONE_DAY_MS))?;
    assert!(matches!(
        service.attribute_trigger("t1")?,
        AttributionOutcome::Attributed { event_reports: 1, .. }
    ));

    let report_id = event_reports(&service)?[0].report_id().to_string();
    assert!(service.increment_report_retry_count(&report_id)?);
    service.delete_expired_records(0, 1)?;
    assert_eq!(event_reports(&service)?.len(), 1);

    // An event source allows one report, swept or not.
    service.register_trigger(TRIGGER, &trigger_ctx("t2", ONE_DAY_MS + 1))?;
    assert!(!matches!(
        service.attribute_trigger("t2")?,
        AttributionOutcome::Attributed { event_reports: 1, .. }
    ));
    assert_eq!(event_reports(&service)?.len(), 1);
    Ok(())
}
