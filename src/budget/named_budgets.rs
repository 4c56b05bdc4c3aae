use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    contribution_filter::ContributionFilter,
    traits::{FilterCapacities, FilterStorage},
};
use crate::error::MeasurementError;

const MAX_BUDGET_NAME_LENGTH: usize = 25;

/// Capacities declared by a source for its named budgets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBudgetCapacities {
    capacities: BTreeMap<String, u64>,
}

impl FilterCapacities for NamedBudgetCapacities {
    type FilterId = String;
    type Budget = u64;
    type Error = anyhow::Error;

    fn capacity(&self, name: &String) -> Result<u64, Self::Error> {
        self.capacities
            .get(name)
            .copied()
            .with_context(|| format!("No named budget {name}"))
    }
}

/// Named sub-allocations of a source's aggregatable contribution capacity.
/// Running contributions are created lazily on first use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatableNamedBudgets {
    capacities: NamedBudgetCapacities,
    filters: BTreeMap<String, ContributionFilter>,
}

impl AggregatableNamedBudgets {
    pub fn new(capacities: BTreeMap<String, u64>) -> Self {
        Self {
            capacities: NamedBudgetCapacities { capacities },
            filters: BTreeMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capacities.capacities.contains_key(name)
    }

    /// Contribution consumed so far under `name`.
    pub fn consumed(&self, name: &str) -> Option<u64> {
        if !self.contains(name) {
            return None;
        }
        Some(self.filters.get(name).map_or(0, |f| f.consumed))
    }

    /// Same capacities with nothing consumed.
    pub fn reset(&self) -> Self {
        Self {
            capacities: self.capacities.clone(),
            filters: BTreeMap::new(),
        }
    }

    /// Parses `{"name": capacity, ...}` from a source registration.
    pub fn parse(
        value: &Value,
        max_budgets: usize,
        max_capacity: u64,
    ) -> Result<Self, MeasurementError> {
        let object = value.as_object().ok_or_else(|| {
            MeasurementError::Parse("named_budgets must be an object".to_string())
        })?;
        if object.len() > max_budgets {
            return Err(MeasurementError::Validation(format!(
                "more than {max_budgets} named budgets"
            )));
        }
        let mut capacities = BTreeMap::new();
        for (name, capacity) in object {
            if name.len() > MAX_BUDGET_NAME_LENGTH {
                return Err(MeasurementError::Validation(format!(
                    "named budget {name} has a name that is too long"
                )));
            }
            let capacity = capacity
                .as_u64()
                .filter(|c| *c <= max_capacity)
                .ok_or_else(|| {
                    MeasurementError::Validation(format!(
                        "named budget {name} must be an integer in [0, {max_capacity}]"
                    ))
                })?;
            capacities.insert(name.clone(), capacity);
        }
        Ok(Self::new(capacities))
    }
}

impl FilterStorage for AggregatableNamedBudgets {
    type FilterId = String;
    type Budget = u64;
    type Filter = ContributionFilter;
    type Capacities = NamedBudgetCapacities;
    type Error = anyhow::Error;

    fn capacities(&self) -> &Self::Capacities {
        &self.capacities
    }

    fn get_filter(
        &self,
        name: &String,
    ) -> Result<Option<ContributionFilter>, Self::Error> {
        Ok(self.filters.get(name).cloned())
    }

    fn set_filter(
        &mut self,
        name: &String,
        filter: ContributionFilter,
    ) -> Result<(), Self::Error> {
        self.filters.insert(name.clone(), filter);
        Ok(())
    }
}
