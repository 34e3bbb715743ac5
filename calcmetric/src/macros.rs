//! Macros for metric error handling.

/// Creates a [`crate::error::MetricError`] from error kind and description.
///
/// Accepts an optional dynamic detail and an optional source error.
#[macro_export]
macro_rules! metric_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::MetricError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::MetricError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::MetricError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::MetricError::from(($kind, $desc, $detail.to_string()))
            .with_source($source)
    };
}

/// Creates and returns a [`crate::error::MetricError`] from the current function.
///
/// Supports the same optional detail and source arguments as [`metric_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::metric_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::metric_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::metric_error!($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::metric_error!(
            $kind,
            $desc,
            $detail,
            source: $source
        ))
    };
}
