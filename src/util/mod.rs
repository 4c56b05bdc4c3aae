pub mod log_util;
