pub mod config;
pub mod context;
pub mod cooldown_retry;
pub mod file_cleaner;
pub mod logging;
pub mod rate_limit;
