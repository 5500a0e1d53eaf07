//! DuoCam Common Utilities
//!
//! Shared infrastructure for all DuoCam crates:
//! - Error types and result aliases
//! - Media clock helpers (timestamps, cadence, drift, stall detection)
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
