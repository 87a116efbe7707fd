//! Execution & Validation
//!
//! Runs planned statements through the external executor and classifies each
//! result set. Oversized results are summarized, never dropped: the raw rows
//! are replaced by a bounded summary before any later LLM call can see them.

use crate::config::RunConfig;
use crate::query_result::{SqlQueryInfo, SubQueryInfo};
use crate::sql_exec::SqlExecutor;
use crate::summarizer;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of executing every statement of one plan attempt.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// First execution error encountered, if any. Later statements still run;
    /// the router only needs one representative failure.
    pub first_error: Option<String>,
    pub executed: usize,
}

pub struct QueryExecution {
    executor: Arc<dyn SqlExecutor>,
}

impl QueryExecution {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Execute every pending statement appended to the sub-query by the
    /// current plan attempt. `from_index` marks where this attempt's
    /// statements begin inside `sql_queries`.
    pub async fn run(
        &self,
        subquery: &mut SubQueryInfo,
        from_index: usize,
        config: &RunConfig,
    ) -> ExecutionOutcome {
        let mut first_error = None;
        let mut executed = 0;

        for info in subquery.sql_queries.iter_mut().skip(from_index) {
            executed += 1;
            match self.executor.execute(&info.sql_query).await {
                Ok(rows) => {
                    info!("Statement returned {} row(s)", rows.len());
                    info.record_rows(rows);
                    classify_and_summarize(info, config);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!("Statement failed: {}", message);
                    info.record_error(message.clone());
                    if first_error.is_none() {
                        first_error = Some(message);
                    }
                }
            }
        }

        ExecutionOutcome {
            first_error,
            executed,
        }
    }
}

/// Flag and summarize an oversized result in place.
fn classify_and_summarize(info: &mut SqlQueryInfo, config: &RunConfig) {
    let Some(rows) = info.sql_query_result.as_ref() else {
        return;
    };
    if summarizer::is_oversized(rows, config) {
        info!(
            "Result oversized ({} rows), replacing with summary",
            rows.len()
        );
        let summary = summarizer::summarize(rows, config);
        info.apply_summary(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PilotError, Result};
    use crate::query_result::Row;
    use async_trait::async_trait;

    struct FixedExecutor {
        rows: usize,
        fail: bool,
    }

    #[async_trait]
    impl SqlExecutor for FixedExecutor {
        async fn execute(&self, _sql: &str) -> Result<Vec<Row>> {
            if self.fail {
                return Err(PilotError::Execution("column 'x' not found".to_string()));
            }
            Ok((0..self.rows)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("v".to_string(), serde_json::json!(i));
                    row
                })
                .collect())
        }
    }

    fn subquery_with_statement() -> SubQueryInfo {
        let mut sub = SubQueryInfo::new("q".to_string());
        sub.sql_queries.push(SqlQueryInfo::new(
            "select v from t".to_string(),
            "SELECT v FROM t".to_string(),
            "test".to_string(),
        ));
        sub
    }

    #[tokio::test]
    async fn test_small_result_keeps_raw_rows() {
        let execution = QueryExecution::new(Arc::new(FixedExecutor {
            rows: 3,
            fail: false,
        }));
        let mut sub = subquery_with_statement();
        let outcome = execution.run(&mut sub, 0, &RunConfig::default()).await;
        assert!(outcome.first_error.is_none());
        let info = &sub.sql_queries[0];
        assert!(info.success);
        assert!(!info.contains_large_results);
        assert_eq!(info.row_count(), 3);
        assert!(info.summary.is_none());
    }

    #[tokio::test]
    async fn test_oversized_result_is_summarized() {
        let execution = QueryExecution::new(Arc::new(FixedExecutor {
            rows: 201,
            fail: false,
        }));
        let mut sub = subquery_with_statement();
        execution.run(&mut sub, 0, &RunConfig::default()).await;
        let info = &sub.sql_queries[0];
        assert!(info.contains_large_results);
        assert!(info.sql_query_result.is_none());
        assert_eq!(info.summary.as_ref().unwrap().row_count, 201);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_reported() {
        let execution = QueryExecution::new(Arc::new(FixedExecutor {
            rows: 0,
            fail: true,
        }));
        let mut sub = subquery_with_statement();
        let outcome = execution.run(&mut sub, 0, &RunConfig::default()).await;
        assert!(outcome.first_error.unwrap().contains("not found"));
        assert!(!sub.sql_queries[0].success);
    }
}
