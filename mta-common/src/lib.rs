//! # MTA Common Library
//!
//! Shared code for the material transfer audit service:
//! - Error and result types
//! - Configuration loading (TOML bootstrap + environment overrides)
//! - Logging bootstrap
//! - Database pool and schema initialization
//! - Timestamp helpers

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
