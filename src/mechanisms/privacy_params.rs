use log::{debug, warn};

use super::combinatorics::{StateSpace, TypeBounds};
use crate::{
    config::EngineConfig,
    error::MeasurementError,
    events::{
        source::{AttributionScopes, PrivacyParameters, Source},
        traits::SourceType,
        trigger_specs::ReportConfig,
    },
};

/// Outcome of checking a source against the information-gain ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyValidation {
    Valid,
    InvalidInformationGainLimit,
    /// Report states and scope states together exceed the scopes threshold.
    InvalidScopesInformationGainLimit,
    InvalidMaxEventStatesLimit,
}

/// Randomized-response flip probability for `num_states` states at
/// `epsilon`.
pub fn compute_flip_probability(num_states: u64, epsilon: f64) -> f64 {
    let k = num_states as f64;
    k / (k + epsilon.exp() - 1.0)
}

fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}

/// Capacity, in bits, of a q-ary symmetric channel where a fake output is
/// drawn uniformly over all `num_states` states with probability
/// `flip_probability`.
pub fn channel_capacity(num_states: u64, flip_probability: f64) -> f64 {
    if num_states <= 1 {
        return 0.0;
    }
    let q = num_states as f64;
    let p = flip_probability * (q - 1.0) / q;
    q.log2() - binary_entropy(p) - p * (q - 1.0).log2()
}

/// Information gain in bits for `num_states` states at `epsilon`.
pub fn compute_information_gain(num_states: u64, epsilon: f64) -> f64 {
    channel_capacity(num_states, compute_flip_probability(num_states, epsilon))
}

/// Computes report-state cardinalities and enforces the privacy ceilings.
#[derive(Debug, Clone, Copy)]
pub struct PrivacyParamsCalculator<'a> {
    config: &'a EngineConfig,
}

impl<'a> PrivacyParamsCalculator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// State space of a report configuration, with each report window
    /// counted once per destination surface.
    pub fn state_space(
        &self,
        report_config: &ReportConfig,
        destination_multiplier: usize,
    ) -> StateSpace {
        let types = report_config
            .report_types()
            .into_iter()
            .map(|shape| TypeBounds {
                slots: shape.windows * destination_multiplier,
                cap: shape.cap as usize,
            })
            .collect();
        StateSpace::new(types, report_config.max_reports() as usize)
    }

    /// Number of report states, combined with the attribution-scope states
    /// when `scopes` is set. Fails above the configured ceiling.
    pub fn compute_num_states(
        &self,
        report_config: &ReportConfig,
        destination_multiplier: usize,
        scopes: Option<&AttributionScopes>,
    ) -> Result<u64, MeasurementError> {
        let report_states = self
            .state_space(report_config, destination_multiplier)
            .num_states();
        let total = match scopes {
            None => report_states,
            Some(scopes) => scoped_num_states(report_states, scopes),
        };
        self.within_ceiling(total)
    }

    fn within_ceiling(&self, states: u128) -> Result<u64, MeasurementError> {
        if states > self.config.max_report_states_per_source as u128 {
            return Err(MeasurementError::InvalidConfiguration(format!(
                "{states} report states exceed the ceiling of {}",
                self.config.max_report_states_per_source
            )));
        }
        Ok(states as u64)
    }

    /// Checks `source` against the state ceiling and the information-gain
    /// thresholds, returning the parameters to persist on the source.
    pub fn validate(
        &self,
        source: &Source,
    ) -> Result<(PrivacyValidation, PrivacyParameters), MeasurementError> {
        let report_states =
            self.compute_num_states(&source.report_config, source.destination_multiplier(), None)?;
        let epsilon = source
            .event_level_epsilon
            .unwrap_or(self.config.default_event_level_epsilon);
        let flip_probability = compute_flip_probability(report_states, epsilon);
        let information_gain = channel_capacity(report_states, flip_probability);
        let params = PrivacyParameters {
            num_states: report_states,
            flip_probability,
            information_gain,
        };
        debug!("Source {} privacy parameters: {params:?}", source.id);

        let dual = source.is_dual_destination();
        let threshold = self.config.info_gain_threshold(source.source_type, dual, false);
        if information_gain > threshold {
            warn!(
                "Source {} information gain {information_gain} exceeds {threshold}",
                source.id
            );
            return Ok((PrivacyValidation::InvalidInformationGainLimit, params));
        }

        let scopes = match &source.attribution_scopes {
            Some(scopes) if self.config.enable_attribution_scopes => scopes,
            _ => return Ok((PrivacyValidation::Valid, params)),
        };

        if source.source_type == SourceType::Event && report_states > scopes.max_event_states {
            warn!(
                "Source {} has {report_states} states, above max_event_states {}",
                source.id, scopes.max_event_states
            );
            return Ok((PrivacyValidation::InvalidMaxEventStatesLimit, params));
        }

        let scoped = self.within_ceiling(scoped_num_states(report_states as u128, scopes))?;
        let scopes_gain = (scoped as f64).log2();
        let scopes_threshold = self.config.info_gain_threshold(source.source_type, dual, true);
        if scopes_gain > scopes_threshold {
            warn!(
                "Source {} attribution-scope information gain {scopes_gain} exceeds {scopes_threshold}",
                source.id
            );
            return Ok((PrivacyValidation::InvalidScopesInformationGainLimit, params));
        }
        Ok((PrivacyValidation::Valid, params))
    }
}

/// Report states plus the states an observer can distinguish through
/// attribution scopes.
fn scoped_num_states(report_states: u128, scopes: &AttributionScopes) -> u128 {
    let extra = (scopes.max_event_states as u128)
        .saturating_mul(scopes.limit.saturating_sub(1) as u128);
    report_states.saturating_add(extra)
}
