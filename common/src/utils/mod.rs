pub mod config;
pub mod timeouts;
