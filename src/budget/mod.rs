pub mod contribution_filter;
pub mod named_budgets;
pub mod traits;
