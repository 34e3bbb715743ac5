//! Utilities for testing metric calculations against a PostgreSQL server.
//!
//! - [`database`] creates uniquely named databases and drops them afterward.
//! - [`metric`] builds configurations, dates and timestamps.
pub mod database;
pub mod metric;
