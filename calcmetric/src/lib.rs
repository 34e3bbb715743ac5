pub mod calculator;
pub mod ddl;
pub mod error;
mod macros;
pub mod maintenance;
pub mod schema;
pub mod store;
pub mod template;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod time_range;
pub mod types;
pub mod upsert;
