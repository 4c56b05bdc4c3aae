pub mod attribution;
pub mod budget;
pub mod config;
pub mod error;
pub mod events;
pub mod mechanisms;
pub mod reports;
pub mod storage;
pub mod util;
