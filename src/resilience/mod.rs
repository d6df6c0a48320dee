//! Resilience
//!
//! Retry with exponential backoff and jitter for refresh exchanges.

pub mod retry;

pub use retry::RetryPolicy;
