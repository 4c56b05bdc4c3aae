use log::{debug, info};
use rand::Rng;

use super::combinatorics::StateSpace;
use crate::events::{
    source::Source,
    traits::AttributionMode,
    trigger_specs::ReportConfig,
};

/// One fabricated report of a noised state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeReportConfig {
    pub trigger_data: u64,
    pub window_index: usize,
    /// 0 for the first destination surface, 1 for the second one of a
    /// dual-destination source.
    pub destination_index: usize,
    /// Position of this report among the reports of its trigger data.
    pub bucket_index: usize,
}

/// Result of the randomized-response draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseOutcome {
    Truthful,
    /// Replace the real output with this (possibly empty) report set.
    Fake(Vec<FakeReportConfig>),
}

/// Draws the output mode of a source: with probability `flip_probability`
/// a state is picked uniformly among all of them using one random index,
/// otherwise the truth is reported.
pub fn draw<R: Rng + ?Sized>(
    report_config: &ReportConfig,
    state_space: &StateSpace,
    destination_multiplier: usize,
    flip_probability: f64,
    rng: &mut R,
) -> NoiseOutcome {
    if rng.gen::<f64>() >= flip_probability {
        return NoiseOutcome::Truthful;
    }

    let num_states = state_space.num_states();
    let index = rng.gen_range(0..num_states);
    let Some(state) = state_space.decode(index) else {
        return NoiseOutcome::Fake(vec![]);
    };

    let shapes = report_config.report_types();
    let mut per_type_count = vec![0usize; shapes.len()];
    let mut fakes = Vec::with_capacity(state.len());
    for (type_index, slot) in state {
        let shape = shapes[type_index];
        let windows = shape.windows.max(1);
        fakes.push(FakeReportConfig {
            trigger_data: shape.trigger_data,
            window_index: slot % windows,
            destination_index: (slot / windows).min(destination_multiplier.saturating_sub(1)),
            bucket_index: per_type_count[type_index],
        });
        per_type_count[type_index] += 1;
    }
    NoiseOutcome::Fake(fakes)
}

/// Moves `source` out of [`AttributionMode::Unassigned`]. Returns `None`
/// without drawing if a mode was already assigned.
pub fn assign_attribution_mode<R: Rng + ?Sized>(
    source: &mut Source,
    state_space: &StateSpace,
    rng: &mut R,
) -> Option<NoiseOutcome> {
    if source.attribution_mode != AttributionMode::Unassigned {
        return None;
    }
    let outcome = draw(
        &source.report_config,
        state_space,
        source.destination_multiplier(),
        source.flip_probability(),
        rng,
    );
    source.attribution_mode = match &outcome {
        NoiseOutcome::Truthful => AttributionMode::Truthfully,
        NoiseOutcome::Fake(_) => AttributionMode::Falsely,
    };
    match &outcome {
        NoiseOutcome::Truthful => debug!("Source {} reports truthfully", source.id),
        NoiseOutcome::Fake(reports) => info!(
            "Source {} noised with {} fake reports",
            source.id,
            reports.len()
        ),
    }
    Some(outcome)
}
