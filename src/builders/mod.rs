//! Builders
//!
//! Fluent builder patterns for OAuth2 and refresh configuration.

pub mod config;

pub use config::{oauth2_config, refresh_config, OAuth2ConfigBuilder, RefreshConfigBuilder};
