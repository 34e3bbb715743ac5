//! Error types and result definitions for metric calculations.
//!
//! Every fallible operation in the crate returns [`MetricResult`]. A [`MetricError`] carries
//! an [`ErrorKind`] classifying the failure, a static description, an optional dynamic detail
//! (for storage failures this holds the offending statement and its parameters), the original
//! source error, the call-site location and a backtrace.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use calcmetric_config::LoadConfigError;
use calcmetric_config::shared::ValidationError;

/// Convenient result type for metric operations using [`MetricError`] as the error type.
pub type MetricResult<T> = Result<T, MetricError>;

/// Detailed payload stored for every [`MetricError`].
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for metric calculations.
#[derive(Debug, Clone)]
pub struct MetricError {
    payload: Box<ErrorPayload>,
}

/// Categories of errors that can occur while calculating a metric.
///
/// Every kind is fatal to the invocation. [`ErrorKind::DestinationTableMissing`] is the only
/// one callers recover from, when checking freshness or deleting rows of a table that was
/// never created.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration Errors
    ConfigError,
    InvalidTimeRange,
    DateParseError,

    // Template Errors
    TemplateError,
    IoError,

    // Schema Errors
    SourceSchemaError,
    DuplicateColumnName,

    // Storage Errors
    ConnectionFailed,
    QueryFailed,
    DestinationTableMissing,
    InvalidData,

    // Unknown / Uncategorized
    Unknown,
}

impl MetricError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.payload.kind
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        &self.payload.description
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        self.payload.detail.as_deref()
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> &Backtrace {
        self.payload.backtrace.as_ref()
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        self.payload.location
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.payload.source = Some(Arc::new(source));
        self
    }

    /// Appends `context` to the detail of this error.
    ///
    /// Storage operations use it to attach the statement and parameters that failed.
    pub fn with_context(mut self, context: impl fmt::Display) -> Self {
        let detail = match self.payload.detail.take() {
            Some(detail) => format!("{detail}\n{context}"),
            None => context.to_string(),
        };
        self.payload.detail = Some(Cow::Owned(detail));
        self
    }

    /// Creates a [`MetricError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        MetricError {
            payload: Box::new(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for MetricError {
    fn eq(&self, other: &MetricError) -> bool {
        self.payload.kind == other.payload.kind
    }
}

impl Hash for MetricError {
    /// Hashes the kind and static description only, so that the same failure raised from
    /// different places with different details hashes identically.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.kind.hash(state);
        self.payload.description.hash(state);
    }
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let payload = &self.payload;
        let location = payload.location;
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            payload.kind,
            payload.description,
            location.file(),
            location.line(),
            location.column()
        )?;

        write_detail(payload.detail.as_deref(), f, 1)?;
        write_backtrace(payload.backtrace.as_ref(), f, 1)?;

        Ok(())
    }
}

impl error::Error for MetricError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.payload
            .source
            .as_ref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

/// Writes the captured backtrace with indentation.
fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    let indent_str = "  ".repeat(indent);

    let rendered_backtrace = format!("{backtrace}");
    if !rendered_backtrace.trim().is_empty() {
        write!(f, "\n{indent_str}Backtrace:")?;
        for line in rendered_backtrace.lines() {
            if line.trim().is_empty() {
                write!(f, "\n{indent_str}  ")?;
            } else {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

/// Writes the detail block with indentation.
fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    if let Some(detail) = detail {
        let indent_str = "  ".repeat(indent);
        if detail.trim().is_empty() {
            write!(f, "\n{indent_str}Detail: <empty>")?;
        } else {
            write!(f, "\n{indent_str}Detail:")?;
            for line in detail.lines() {
                if line.trim().is_empty() {
                    write!(f, "\n{indent_str}  ")?;
                } else {
                    write!(f, "\n{indent_str}  {line}")?;
                }
            }
        }
    }

    Ok(())
}

/// Creates a [`MetricError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for MetricError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> MetricError {
        MetricError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`MetricError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for MetricError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> MetricError {
        MetricError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Converts [`std::io::Error`] to [`MetricError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for MetricError {
    #[track_caller]
    fn from(err: std::io::Error) -> MetricError {
        let detail = err.to_string();
        MetricError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`chrono::ParseError`] to [`MetricError`] with [`ErrorKind::DateParseError`].
impl From<chrono::ParseError> for MetricError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> MetricError {
        let detail = err.to_string();
        MetricError::from_components(
            ErrorKind::DateParseError,
            Cow::Borrowed("Date parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`LoadConfigError`] to [`MetricError`] with [`ErrorKind::ConfigError`].
impl From<LoadConfigError> for MetricError {
    #[track_caller]
    fn from(err: LoadConfigError) -> MetricError {
        let detail = err.to_string();
        MetricError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration loading failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`ValidationError`] to [`MetricError`] with [`ErrorKind::ConfigError`].
impl From<ValidationError> for MetricError {
    #[track_caller]
    fn from(err: ValidationError) -> MetricError {
        let detail = err.to_string();
        MetricError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`tokio_postgres::Error`] to [`MetricError`] with the appropriate error kind.
///
/// Errors are classified by their SQLSTATE class. An error without SQLSTATE never reached
/// the server and is reported as a connection failure. Server errors keep the message,
/// detail and hint reported by the server.
impl From<tokio_postgres::Error> for MetricError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> MetricError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => classify_sqlstate(sqlstate.code()),
            None => (ErrorKind::ConnectionFailed, "PostgreSQL connection failed"),
        };

        let detail = match err.as_db_error() {
            Some(db_error) => {
                let mut detail = format!("{}: {}", db_error.severity(), db_error.message());
                if let Some(extra) = db_error.detail() {
                    detail.push_str(&format!("\nDETAIL: {extra}"));
                }
                if let Some(hint) = db_error.hint() {
                    detail.push_str(&format!("\nHINT: {hint}"));
                }
                detail
            }
            None => err.to_string(),
        };
        MetricError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps a SQLSTATE code to an error kind and description, by class.
fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code.get(..2).unwrap_or_default() {
        // Connection exception
        "08" => (ErrorKind::ConnectionFailed, "PostgreSQL connection failed"),
        // Invalid authorization specification
        "28" => (
            ErrorKind::ConnectionFailed,
            "PostgreSQL authentication failed",
        ),
        // Insufficient resources, operator intervention
        "53" | "57" => (
            ErrorKind::ConnectionFailed,
            "PostgreSQL server unavailable",
        ),
        // Data exception
        "22" => (ErrorKind::InvalidData, "PostgreSQL data conversion failed"),
        // Integrity constraint violation
        "23" => (ErrorKind::InvalidData, "PostgreSQL constraint violation"),
        // Syntax error or access rule violation
        "42" => (ErrorKind::QueryFailed, "PostgreSQL syntax or access error"),
        // Program limit exceeded
        "54" => (
            ErrorKind::QueryFailed,
            "PostgreSQL program limit exceeded",
        ),
        _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric_error;

    #[test]
    fn test_classify_sqlstate() {
        assert_eq!(classify_sqlstate("42P01").0, ErrorKind::QueryFailed);
        assert_eq!(classify_sqlstate("42601").0, ErrorKind::QueryFailed);
        assert_eq!(classify_sqlstate("22007").0, ErrorKind::InvalidData);
        assert_eq!(classify_sqlstate("23505").0, ErrorKind::InvalidData);
        assert_eq!(classify_sqlstate("08006").0, ErrorKind::ConnectionFailed);
        assert_eq!(classify_sqlstate("28P01").0, ErrorKind::ConnectionFailed);
        assert_eq!(classify_sqlstate("XX000").0, ErrorKind::QueryFailed);
        assert_eq!(classify_sqlstate("").0, ErrorKind::QueryFailed);
    }

    #[test]
    fn test_with_context_appends_detail() {
        let err = metric_error!(ErrorKind::QueryFailed, "Statement failed", "relation missing")
            .with_context("sql: select 1")
            .with_context("params: []");

        assert_eq!(
            err.detail(),
            Some("relation missing\nsql: select 1\nparams: []")
        );
    }

    #[test]
    fn test_with_context_without_detail() {
        let err = metric_error!(ErrorKind::QueryFailed, "Statement failed").with_context("sql");
        assert_eq!(err.detail(), Some("sql"));
    }

    #[test]
    fn test_display_includes_kind_and_detail() {
        let err = metric_error!(
            ErrorKind::InvalidTimeRange,
            "Unknown time range",
            "unknown time range: '3m'"
        );
        let rendered = err.to_string();

        assert!(rendered.starts_with("[InvalidTimeRange] Unknown time range @ "));
        assert!(rendered.contains("\n  Detail:\n    unknown time range: '3m'"));
    }

    #[test]
    fn test_equality_uses_kind() {
        let a = metric_error!(ErrorKind::ConfigError, "a");
        let b = metric_error!(ErrorKind::ConfigError, "b", "detail");
        let c = metric_error!(ErrorKind::TemplateError, "a");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_config_error_conversion() {
        let err: MetricError = LoadConfigError::MissingVariable("V3_CONN").into();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(
            err.detail(),
            Some("you must define V3_CONN environment variable to run this")
        );
        assert!(error::Error::source(&err).is_some());
    }
}
