//! # DFD Common Library
//!
//! Shared code for the deepfake detection service:
//! - Error type used during startup and configuration
//! - Layered configuration (CLI/ENV overrides, TOML file, compiled defaults)
//! - Logging configuration

pub mod config;
pub mod error;

pub use config::ServiceConfig;
pub use error::{Error, Result};
