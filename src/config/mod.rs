//! Ingestion configuration
//!
//! Loaded from TOML, with every value defaulted so an empty or missing file
//! is a valid configuration.
//!
//! ## Loading Order
//!
//! 1. `BROKERPOLL_CONFIG` environment variable (path to TOML file)
//! 2. `brokerpoll.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded config is passed explicitly to the components that need it;
//! there is no process-global instance.

mod settings;
pub mod defaults;
pub mod validation;

pub use settings::*;
