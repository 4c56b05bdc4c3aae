use anyhow::bail;
use log::debug;
use serde::{Deserialize, Serialize};

use super::traits::{Filter, FilterStatus};

/// Running sum of aggregatable values charged against a fixed capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionFilter {
    pub consumed: u64,
    pub capacity: u64,
}

impl ContributionFilter {
    fn fits(&self, value: u64) -> bool {
        self.consumed
            .checked_add(value)
            .is_some_and(|total| total <= self.capacity)
    }
}

impl Filter<u64> for ContributionFilter {
    type Error = anyhow::Error;

    fn new(capacity: u64) -> Result<Self, Self::Error> {
        Ok(Self {
            consumed: 0,
            capacity,
        })
    }

    fn can_consume(&self, value: &u64) -> Result<FilterStatus, Self::Error> {
        if self.fits(*value) {
            Ok(FilterStatus::Continue)
        } else {
            Ok(FilterStatus::OutOfBudget)
        }
    }

    fn try_consume(&mut self, value: &u64) -> Result<FilterStatus, Self::Error> {
        if !self.fits(*value) {
            debug!(
                "Contribution of {value} rejected: {} of {} already consumed",
                self.consumed, self.capacity
            );
            return Ok(FilterStatus::OutOfBudget);
        }
        self.consumed += value;
        Ok(FilterStatus::Continue)
    }

    fn remaining_budget(&self) -> Result<u64, Self::Error> {
        if self.consumed > self.capacity {
            bail!(
                "Filter over capacity: consumed {} > capacity {}",
                self.consumed,
                self.capacity
            );
        }
        Ok(self.capacity - self.consumed)
    }
}
