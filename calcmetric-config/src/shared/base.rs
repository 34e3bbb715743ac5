use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required value is present but empty.
    #[error("`{0}` cannot be empty")]
    EmptyValue(&'static str),
    /// The connection string could not be parsed.
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
}
