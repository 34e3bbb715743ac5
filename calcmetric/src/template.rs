//! SQL templates computing a metric.
//!
//! A template is a plain SQL file named after its metric. Placeholders are replaced
//! literally, nothing is escaped or quoted except the date bounds, so values must already
//! be valid SQL where they are substituted:
//!
//! | placeholder         | replaced by                                  |
//! |---------------------|----------------------------------------------|
//! | `{{project_slug}}`  | the project slug                             |
//! | `{{limit}}`         | `V3_LIMIT`, when non-empty                   |
//! | `{{offset}}`        | `V3_OFFSET`, when non-empty                  |
//! | `{{<name>}}`        | `V3_PARAM_<name>`                            |
//! | `{{date_from}}`     | the window start, as `'YYYY-MM-DD'`          |
//! | `{{date_to}}`       | the window end, as `'YYYY-MM-DD'`            |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use calcmetric_config::shared::MetricConfig;
use tracing::debug;

use crate::error::{ErrorKind, MetricResult};
use crate::metric_error;
use crate::types::DateWindow;

/// Values substituted into a [`QueryTemplate`].
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub project_slug: &'a str,
    pub limit: Option<&'a str>,
    pub offset: Option<&'a str>,
    pub params: &'a BTreeMap<String, String>,
    pub window: DateWindow,
}

impl<'a> TemplateContext<'a> {
    pub fn from_config(config: &'a MetricConfig, window: DateWindow) -> Self {
        Self {
            project_slug: &config.project_slug,
            limit: config.limit.as_deref(),
            offset: config.offset.as_deref(),
            params: &config.params,
            window,
        }
    }
}

/// The SQL of a metric, before substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    source: Option<PathBuf>,
    text: String,
}

impl QueryTemplate {
    /// Creates a template from its text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            source: None,
            text: text.into(),
        }
    }

    /// Reads the template of `metric` from `<sql_path>/<metric>.sql`.
    pub async fn load(sql_path: impl AsRef<Path>, metric: &str) -> MetricResult<Self> {
        let path = sql_path.as_ref().join(format!("{metric}.sql"));

        let text = tokio::fs::read_to_string(&path).await.map_err(|err| {
            metric_error!(
                ErrorKind::TemplateError,
                "Query template could not be read",
                format!("{}: {err}", path.display()),
                source: err
            )
        })?;
        debug!(path = %path.display(), bytes = text.len(), "loaded query template");

        Ok(Self {
            source: Some(path),
            text,
        })
    }

    /// Returns the file the template was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitutes every placeholder of `context` into the template.
    pub fn render(&self, context: &TemplateContext<'_>) -> String {
        let mut sql = self.text.replace("{{project_slug}}", context.project_slug);

        if let Some(limit) = context.limit.filter(|limit| !limit.is_empty()) {
            sql = sql.replace("{{limit}}", limit);
        }
        if let Some(offset) = context.offset.filter(|offset| !offset.is_empty()) {
            sql = sql.replace("{{offset}}", offset);
        }
        for (name, value) in context.params {
            sql = sql.replace(&format!("{{{{{name}}}}}"), value);
        }

        sql.replace("{{date_from}}", &quote_date(context.window.from))
            .replace("{{date_to}}", &quote_date(context.window.to))
    }
}

fn quote_date(date: chrono::NaiveDate) -> String {
    format!("'{}'", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn window() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2023, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 11, 1).unwrap(),
        )
    }

    #[test]
    fn test_render_all_placeholders() {
        let template = QueryTemplate::new(
            "select author, count(*) as cnt from commits \
             where project = '{{project_slug}}' and repo_group = {{repo_group}} \
             and created_at >= {{date_from}} and created_at < {{date_to}} \
             limit {{limit}} offset {{offset}}",
        );
        let params = BTreeMap::from([("repo_group".to_string(), "'apps'".to_string())]);
        let context = TemplateContext {
            project_slug: "kubernetes",
            limit: Some("10"),
            offset: Some("20"),
            params: &params,
            window: window(),
        };

        assert_eq!(
            template.render(&context),
            "select author, count(*) as cnt from commits \
             where project = 'kubernetes' and repo_group = 'apps' \
             and created_at >= '2023-10-01' and created_at < '2023-11-01' \
             limit 10 offset 20"
        );
    }

    #[test]
    fn test_render_leaves_empty_limit_untouched() {
        let template = QueryTemplate::new("select 1 limit {{limit}} offset {{offset}}");
        let params = BTreeMap::new();
        let context = TemplateContext {
            project_slug: "kubernetes",
            limit: Some(""),
            offset: None,
            params: &params,
            window: window(),
        };

        assert_eq!(
            template.render(&context),
            "select 1 limit {{limit}} offset {{offset}}"
        );
    }

    #[test]
    fn test_param_names_are_case_sensitive() {
        let template = QueryTemplate::new("{{Min}} {{min}} {{min}}");
        let params = BTreeMap::from([("min".to_string(), "5".to_string())]);
        let context = TemplateContext {
            project_slug: "kubernetes",
            limit: None,
            offset: None,
            params: &params,
            window: window(),
        };

        assert_eq!(template.render(&context), "{{Min}} 5 5");
    }

    #[tokio::test]
    async fn test_load_missing_template() {
        let err = QueryTemplate::load("/nonexistent/calcmetric", "contributors")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TemplateError);
        assert!(
            err.detail()
                .unwrap()
                .starts_with("/nonexistent/calcmetric/contributors.sql: ")
        );
    }

    #[tokio::test]
    async fn test_load_template() {
        let dir = std::env::temp_dir().join(format!("calcmetric-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("contributors.sql"), "select {{limit}}")
            .await
            .unwrap();

        let template = QueryTemplate::load(&dir, "contributors").await.unwrap();
        assert_eq!(template.text(), "select {{limit}}");
        assert_eq!(template.source(), Some(dir.join("contributors.sql").as_path()));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
