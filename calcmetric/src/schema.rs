//! Inference of metric table columns from query result metadata.

use std::collections::HashSet;

use crate::bail;
use crate::error::{ErrorKind, MetricResult};
use crate::types::{ColumnDescriptor, ColumnType, SourceColumn};

/// Fixed columns leading every metric table, in table order.
pub const IDENTITY_COLUMNS: [&str; 6] = [
    "time_range",
    "project_slug",
    "last_calculated_at",
    "date_from",
    "date_to",
    "row_number",
];

/// Maps a driver-reported type name to its canonical column type.
///
/// Returns [`None`] for types outside the supported set.
pub fn canonical_type(type_name: &str) -> Option<ColumnType> {
    let column_type = match type_name.to_lowercase().as_str() {
        "text" => ColumnType::Text,
        "bool" | "boolean" => ColumnType::Boolean,
        "date" => ColumnType::Date,
        "interval" => ColumnType::Interval,
        "numeric" => ColumnType::Numeric,
        "varchar" | "bpchar" | "char" | "name" => ColumnType::Text,
        "timestamp" | "timestamptz" => ColumnType::Timestamp,
        "int2" | "int4" | "int8" => ColumnType::BigInt,
        "float4" | "float8" => ColumnType::Numeric,
        _ => return None,
    };

    Some(column_type)
}

/// Builds the value columns of a metric table from the columns of a query result.
///
/// Unknown types are rejected unless `guess_type` is set, in which case the lowercased
/// type name is used as is. Column names must be unique, and must not collide with
/// [`IDENTITY_COLUMNS`].
pub fn infer_columns(
    columns: &[SourceColumn],
    guess_type: bool,
) -> MetricResult<Vec<ColumnDescriptor>> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(columns.len());
    let mut descriptors = Vec::with_capacity(columns.len());

    for column in columns {
        if IDENTITY_COLUMNS.contains(&column.name.as_str()) {
            bail!(
                ErrorKind::DuplicateColumnName,
                "Column name collides with an identity column",
                format!("column '{}' is reserved", column.name)
            );
        }
        if !seen.insert(column.name.as_str()) {
            bail!(
                ErrorKind::DuplicateColumnName,
                "Non unique column name",
                format!("non unique column name '{}'", column.name)
            );
        }

        let column_type = match canonical_type(&column.type_name) {
            Some(column_type) => column_type,
            None if guess_type => ColumnType::Guessed(column.type_name.to_lowercase()),
            None => bail!(
                ErrorKind::SourceSchemaError,
                "Unknown column type",
                format!(
                    "unknown type: '{}' of column '{}'",
                    column.type_name, column.name
                )
            ),
        };

        descriptors.push(ColumnDescriptor {
            name: column.name.clone(),
            column_type,
            nullable: column.nullable,
        });
    }

    Ok(descriptors)
}
