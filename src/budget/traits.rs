use std::fmt::Debug;

/// Trait for contribution budgets
pub trait Budget: Clone + Debug {
    // For now just a marker trait requiring Clone
}

impl Budget for u64 {}

/// Trait for a contribution filter.
pub trait Filter<B: Budget> {
    type Error;

    /// Initializes a new filter with a given capacity.
    fn new(capacity: B) -> Result<Self, Self::Error>
    where
        Self: Sized;

    /// Checks if the filter has enough budget without consuming
    fn can_consume(&self, budget: &B) -> Result<FilterStatus, Self::Error>;

    /// Tries to consume a given budget from the filter. An out-of-budget
    /// request leaves the filter untouched.
    fn try_consume(&mut self, budget: &B) -> Result<FilterStatus, Self::Error>;

    /// Gets the remaining budget for this filter.
    fn remaining_budget(&self) -> Result<B, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    OutOfBudget,
}

pub trait FilterCapacities {
    type FilterId;
    type Budget: Budget;
    type Error;

    fn capacity(
        &self,
        filter_id: &Self::FilterId,
    ) -> Result<Self::Budget, Self::Error>;
}

/// Trait for an interface or object that maintains a collection of filters.
pub trait FilterStorage {
    type FilterId: Debug;
    type Budget: Budget;
    type Filter: Filter<Self::Budget, Error = Self::Error>;
    type Capacities: FilterCapacities<
        FilterId = Self::FilterId,
        Budget = Self::Budget,
        Error = Self::Error,
    >;
    type Error;

    /// Get the capacities object that was passed to the constructor.
    fn capacities(&self) -> &Self::Capacities;

    /// Get the filter with the given ID from the storage.
    /// Returns None if the filter has not been set yet.
    fn get_filter(
        &self,
        filter_id: &Self::FilterId,
    ) -> Result<Option<Self::Filter>, Self::Error>;

    /// Store the filter with the given ID in the storage.
    fn set_filter(
        &mut self,
        filter_id: &Self::FilterId,
        filter: Self::Filter,
    ) -> Result<(), Self::Error>;

    /// Get the filter with the given ID from the storage, or return a new one
    /// with its declared capacity if it does not exist.
    fn get_filter_or_new(
        &self,
        filter_id: &Self::FilterId,
    ) -> Result<Self::Filter, Self::Error> {
        let filter = match self.get_filter(filter_id)? {
            Some(filter) => filter,
            None => {
                let capacity = self.capacities().capacity(filter_id)?;
                Self::Filter::new(capacity)?
            }
        };
        Ok(filter)
    }

    /// Edit the filter with the given ID, creating a new one if it does not
    /// exist.
    fn edit_filter_or_new<R>(
        &mut self,
        filter_id: &Self::FilterId,
        f: impl FnOnce(&mut Self::Filter) -> Result<R, Self::Error>,
    ) -> Result<R, Self::Error> {
        let mut filter = self.get_filter_or_new(filter_id)?;
        let r = f(&mut filter)?;
        self.set_filter(filter_id, filter)?;
        Ok(r)
    }

    /// Check if budget can be consumed from the given filter,
    /// without modifying state.
    fn can_consume(
        &self,
        filter_id: &Self::FilterId,
        budget: &Self::Budget,
    ) -> Result<FilterStatus, Self::Error> {
        self.get_filter_or_new(filter_id)?.can_consume(budget)
    }

    /// Try to consume budget from the given filter.
    fn try_consume(
        &mut self,
        filter_id: &Self::FilterId,
        budget: &Self::Budget,
    ) -> Result<FilterStatus, Self::Error> {
        self.edit_filter_or_new(filter_id, |f| f.try_consume(budget))
    }
}
