//! Shared configuration types for metric calculations.

mod base;
mod connection;
mod metric;

pub use base::ValidationError;
pub use connection::{CALCMETRIC_OPTIONS, PgConnectionOptions, connection_config};
pub use metric::MetricConfig;
