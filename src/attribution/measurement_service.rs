use log::{debug, info, warn};
use rand::Rng;

use super::{
    core::{AttributionCore, AttributionOutcome},
    registration::{AdmissionOutcome, SourceRegistrar},
};
use crate::{
    config::EngineConfig,
    error::MeasurementError,
    events::{
        parsing::{
            parse_source, parse_trigger, SourceRegistrationContext,
            TriggerRegistrationContext,
        },
        traits::Timestamp,
    },
    storage::traits::{Datastore, ExpiredRecords, MeasurementDao},
};

/// Entry points of the measurement engine, over a generic transactional
/// datastore. Every operation is a single transaction.
///
/// The random source is owned by the service so that noise draws can be
/// made reproducible with a seeded generator.
pub struct MeasurementService<DS: Datastore, R: Rng> {
    config: EngineConfig,

    /// Transactional storage for sources, triggers and reports.
    pub datastore: DS,

    rng: R,
}

impl<DS: Datastore, R: Rng> MeasurementService<DS, R> {
    pub fn new(config: EngineConfig, datastore: DS, rng: R) -> Result<Self, MeasurementError> {
        config.check()?;
        Ok(Self {
            config,
            datastore,
            rng,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parses, validates and stores a source. Returns the stored source id.
    ///
    /// A rejected source is not stored; the rejection is returned as the
    /// error after its debug report, if any, has been committed.
    pub fn register_source(
        &mut self,
        json: &str,
        ctx: &SourceRegistrationContext,
    ) -> Result<String, MeasurementError> {
        debug!("Registering source {}", ctx.source_id);
        let source = parse_source(json, ctx, &self.config)?;
        let registrar = SourceRegistrar::new(&self.config);
        let outcome = self
            .datastore
            .run_in_transaction_with_result(|dao| registrar.admit(dao, source))?;
        match outcome {
            AdmissionOutcome::Admitted {
                source_id,
                evicted_sources,
                ignored_sources,
            } => {
                if !evicted_sources.is_empty() || !ignored_sources.is_empty() {
                    info!(
                        "Source {source_id} evicted {evicted_sources:?} and ignored {ignored_sources:?}"
                    );
                }
                Ok(source_id)
            }
            AdmissionOutcome::Rejected(err) => {
                warn!("Source {} rejected: {err}", ctx.source_id);
                Err(err)
            }
        }
    }

    /// Registers a copy of a stored source on behalf of another ad-tech.
    /// The copy goes through the same admission checks as its parent.
    pub fn register_derived_source(
        &mut self,
        parent_id: &str,
        source_id: &str,
        enrollment_id: &str,
        registration_origin: &str,
    ) -> Result<String, MeasurementError> {
        let registrar = SourceRegistrar::new(&self.config);
        let outcome = self.datastore.run_in_transaction_with_result(|dao| {
            let parent = dao.get_source(parent_id)?.ok_or_else(|| {
                MeasurementError::Validation(format!("Unknown parent source {parent_id}"))
            })?;
            let derived = parent.derive_for(source_id, enrollment_id, registration_origin);
            registrar.admit(dao, derived)
        })?;
        match outcome {
            AdmissionOutcome::Admitted { source_id, .. } => Ok(source_id),
            AdmissionOutcome::Rejected(err) => Err(err),
        }
    }

    /// Parses and stores a pending trigger. A malformed trigger is never
    /// stored.
    pub fn register_trigger(
        &mut self,
        json: &str,
        ctx: &TriggerRegistrationContext,
    ) -> Result<String, MeasurementError> {
        debug!("Registering trigger {}", ctx.trigger_id);
        let trigger = parse_trigger(json, ctx, &self.config)?;
        let trigger_id = trigger.id.clone();
        self.datastore.run_in_transaction(|dao| {
            dao.insert_trigger(trigger)?;
            Ok(())
        })?;
        info!("Trigger {trigger_id} registered");
        Ok(trigger_id)
    }

    /// Attributes one trigger. On error nothing is committed and the
    /// trigger stays pending.
    pub fn attribute_trigger(
        &mut self,
        trigger_id: &str,
    ) -> Result<AttributionOutcome, MeasurementError> {
        let core = AttributionCore::new(&self.config);
        let rng = &mut self.rng;
        self.datastore
            .run_in_transaction_with_result(|dao| core.attribute(dao, trigger_id, rng))
    }

    /// Attributes pending triggers, oldest first, up to the per-invocation
    /// limit. Returns true when no pending trigger is left.
    pub fn process_pending_triggers(&mut self) -> Result<bool, MeasurementError> {
        let limit = self.config.max_attributions_per_invocation;
        // One extra id tells whether work remains past the limit.
        let pending = self
            .datastore
            .run_in_transaction_with_result(|dao| Ok(dao.pending_trigger_ids(limit + 1)?))?;
        let remaining = pending.len() > limit;

        for trigger_id in pending.iter().take(limit) {
            let outcome = self.attribute_trigger(trigger_id)?;
            debug!("Trigger {trigger_id}: {outcome:?}");
        }
        Ok(!remaining)
    }

    /// Sweeps expired records; see [`MeasurementDao::delete_expired_records`].
    pub fn delete_expired_records(
        &mut self,
        earliest_valid_time: Timestamp,
        retry_limit: u32,
    ) -> Result<ExpiredRecords, MeasurementError> {
        let expired = self.datastore.run_in_transaction_with_result(|dao| {
            Ok(dao.delete_expired_records(earliest_valid_time, retry_limit)?)
        })?;
        info!("Expiry sweep removed {expired:?}");
        Ok(expired)
    }

    /// Records a failed delivery attempt. Returns false for unknown reports.
    pub fn increment_report_retry_count(
        &mut self,
        report_id: &str,
    ) -> Result<bool, MeasurementError> {
        self.datastore
            .run_in_transaction_with_result(|dao| Ok(dao.increment_report_retry_count(report_id)?))
    }
}
