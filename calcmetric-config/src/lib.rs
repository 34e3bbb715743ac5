//! Configuration for metric calculations.
//!
//! Loads the flat, `V3_`-prefixed environment mapping into a typed [`shared::MetricConfig`]
//! and provides the Postgres connection presets used by every calculation.

mod load;
pub mod shared;

pub use load::{LoadConfigError, load_config, load_config_from};
