//! Core Components
//!
//! HTTP transport seam and per-call cancellation context.

pub mod context;
pub mod transport;

pub use context::*;
pub use transport::*;
