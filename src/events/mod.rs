pub mod aggregation;
pub mod bounded;
pub mod filters;
pub mod parsing;
pub mod source;
pub mod traits;
pub mod trigger;
pub mod trigger_specs;
