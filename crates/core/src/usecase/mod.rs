pub mod circuit_breaker;
pub mod context;
pub mod feature_flags;
pub mod job_manager;
pub mod retry;
pub mod router;
pub mod worker;
