pub mod db;
pub mod paths;
pub mod store;
pub mod types;
