pub mod aliases;
pub mod core;
pub mod measurement_service;
pub mod quotas;
pub mod registration;
