//! Engine-wide foundations for Ember.
//!
//! This crate provides the pieces every other crate leans on:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - JSON engine configuration

mod config;
mod error;
mod logging;
mod timer;

pub use config::{BackendKind, DescriptorBudget, EngineConfig, WindowConfig, read_json};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::Timer;
