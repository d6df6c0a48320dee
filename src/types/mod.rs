//! Token Lifecycle Types
//!
//! Token values, configuration snapshots and status reports.

pub mod config;
pub mod status;
pub mod token;

pub use config::*;
pub use status::*;
pub use token::*;
