pub mod liveness;
pub mod operations;
pub mod readiness;
