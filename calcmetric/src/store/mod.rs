//! Storage of metric tables.
//!
//! [`MetricStore`] is the seam between the calculation flow and the database. The
//! [`postgres::PgMetricStore`] implementation runs against a live server, while
//! [`memory::MemoryMetricStore`] keeps tables in memory for tests and development.

mod base;
pub mod memory;
pub mod postgres;

pub use base::{ComputationRecord, MaterializeRequest, MetricStore};
