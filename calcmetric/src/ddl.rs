//! DDL for metric tables.
//!
//! Every statement uses `if not exists`, so the whole set can be issued before each
//! computation without altering an existing table.

use pg_escape::quote_identifier;

use crate::types::ColumnDescriptor;

/// Identity columns and their types, in table order.
const IDENTITY_COLUMN_DEFINITIONS: [(&str, &str); 6] = [
    ("time_range", "varchar(6)"),
    ("project_slug", "text"),
    ("last_calculated_at", "timestamp"),
    ("date_from", "date"),
    ("date_to", "date"),
    ("row_number", "int"),
];

/// Columns forming the primary key, which is also the upsert conflict target.
pub const PRIMARY_KEY_COLUMNS: [&str; 5] = [
    "time_range",
    "project_slug",
    "date_from",
    "date_to",
    "row_number",
];

/// Builds the `create table if not exists` statement for a metric table.
///
/// Value columns are appended after the identity columns, with `not null` only when the
/// source reported them as non nullable.
pub fn build_create_table_sql(table: &str, columns: &[ColumnDescriptor]) -> String {
    let identity = IDENTITY_COLUMN_DEFINITIONS
        .iter()
        .map(|(name, typ)| format!("  {name} {typ} not null"));
    let values = columns.iter().map(|column| {
        let nullability = if column.nullable == Some(false) {
            " not null"
        } else {
            ""
        };
        format!(
            "  {} {}{}",
            quote_identifier(&column.name),
            column.column_type.as_sql(),
            nullability
        )
    });

    let mut definitions: Vec<String> = identity.chain(values).collect();
    definitions.push(format!("  primary key ({})", PRIMARY_KEY_COLUMNS.join(", ")));

    format!(
        "create table if not exists {} (\n{}\n)",
        quote_identifier(table),
        definitions.join(",\n")
    )
}

/// Builds the index statements of a metric table.
///
/// `time_range` is always indexed. `project_slug` is indexed only for shared tables, since a
/// per-project table holds a single project. Each of `indexed_columns` gets its own index.
pub fn build_create_index_sql(
    table: &str,
    per_project: bool,
    indexed_columns: &[&str],
) -> Vec<String> {
    let mut columns = vec!["time_range"];
    if !per_project {
        columns.push("project_slug");
    }
    columns.extend_from_slice(indexed_columns);

    columns
        .into_iter()
        .map(|column| {
            format!(
                "create index if not exists {} on {} ({})",
                quote_identifier(&format!("{table}_{column}_idx")),
                quote_identifier(table),
                quote_identifier(column)
            )
        })
        .collect()
}

/// Builds every statement needed for a metric table to exist, table first.
pub fn build_table_ddl(
    table: &str,
    columns: &[ColumnDescriptor],
    per_project: bool,
    indexed_columns: &[&str],
) -> Vec<String> {
    let mut statements = vec![build_create_table_sql(table, columns)];
    statements.extend(build_create_index_sql(table, per_project, indexed_columns));

    statements
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::types::ColumnType;

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("cnt", ColumnType::BigInt),
            ColumnDescriptor {
                nullable: Some(false),
                ..ColumnDescriptor::new("author", ColumnType::Text)
            },
            ColumnDescriptor::new("FirstSeen", ColumnType::Timestamp),
        ]
    }

    #[test]
    fn test_create_table_sql() {
        let sql = build_create_table_sql("metric_contributors", &columns());

        assert_snapshot!(sql, @r#"
        create table if not exists metric_contributors (
          time_range varchar(6) not null,
          project_slug text not null,
          last_calculated_at timestamp not null,
          date_from date not null,
          date_to date not null,
          row_number int not null,
          cnt bigint,
          author text not null,
          "FirstSeen" timestamp,
          primary key (time_range, project_slug, date_from, date_to, row_number)
        )
        "#);
    }

    #[test]
    fn test_create_table_quotes_table_name() {
        let sql = build_create_table_sql("metric_cncf/kubernetes", &[]);

        assert!(sql.starts_with("create table if not exists \"metric_cncf/kubernetes\" (\n"));
        assert!(sql.ends_with("  primary key (time_range, project_slug, date_from, date_to, row_number)\n)"));
    }

    #[test]
    fn test_shared_table_indexes() {
        let statements = build_create_index_sql("metric_contributors", false, &["author"]);

        assert_eq!(
            statements,
            vec![
                "create index if not exists metric_contributors_time_range_idx on metric_contributors (time_range)",
                "create index if not exists metric_contributors_project_slug_idx on metric_contributors (project_slug)",
                "create index if not exists metric_contributors_author_idx on metric_contributors (author)",
            ]
        );
    }

    #[test]
    fn test_per_project_table_skips_project_slug_index() {
        let statements = build_create_index_sql("metric_contributors_k8s", true, &[]);

        assert_eq!(
            statements,
            vec![
                "create index if not exists metric_contributors_k8s_time_range_idx on metric_contributors_k8s (time_range)",
            ]
        );
    }

    #[test]
    fn test_table_ddl_starts_with_table() {
        let statements = build_table_ddl("metric_contributors", &columns(), false, &[]);

        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("create table if not exists"));
        assert!(statements[1..].iter().all(|s| s.starts_with("create index")));
    }
}
