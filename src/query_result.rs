//! Query Result Model
//!
//! The mutable record threaded through a run. One `QueryResult` per client
//! request, one `SubQueryInfo` per decomposed sub-question, one `SqlQueryInfo`
//! per planned SQL statement. Pure data with bookkeeping helpers; the pipeline
//! is the single writer.

use crate::summarizer::ResultSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// One result row as returned by the execution service.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Classification of a sub-question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    DataQuery,
    Conversational,
    ToolOnly,
}

/// One error captured at a node boundary. Append-only, never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Node or subsystem the error originated from.
    pub origin: String,
    pub message: String,
}

/// One tool call made on behalf of a sub-query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: String,
    #[serde(default)]
    pub output: Option<String>,
}

/// One planned SQL statement and its outcome.
///
/// Once `contains_large_results` has been evaluated, exactly one of
/// `sql_query_result` and `summary` is populated: raw rows XOR summary.
#[derive(Debug, Clone, Serialize)]
pub struct SqlQueryInfo {
    /// Executable statement handed to the execution service.
    pub sql_query: String,
    /// Keyword-uppercased variant for display.
    pub display_sql: String,
    pub explanation: String,
    pub sql_query_result: Option<Vec<Row>>,
    pub success: bool,
    pub error: Option<String>,
    pub contains_large_results: bool,
    pub summary: Option<ResultSummary>,
}

impl SqlQueryInfo {
    pub fn new(sql_query: String, display_sql: String, explanation: String) -> Self {
        Self {
            sql_query,
            display_sql,
            explanation,
            sql_query_result: None,
            success: false,
            error: None,
            contains_large_results: false,
            summary: None,
        }
    }

    /// Record a successful execution with its raw rows.
    pub fn record_rows(&mut self, rows: Vec<Row>) {
        self.sql_query_result = Some(rows);
        self.success = true;
        self.error = None;
    }

    /// Record a failed execution.
    pub fn record_error(&mut self, message: String) {
        self.success = false;
        self.error = Some(message);
    }

    /// Replace raw rows with a bounded summary. Rows are dropped here so the
    /// raw-XOR-summary invariant holds from this point on.
    pub fn apply_summary(&mut self, summary: ResultSummary) {
        self.contains_large_results = true;
        self.sql_query_result = None;
        self.summary = Some(summary);
    }

    pub fn row_count(&self) -> usize {
        self.sql_query_result.as_ref().map(|r| r.len()).unwrap_or(0)
    }
}

/// One decomposed sub-question and everything accumulated while answering it.
#[derive(Debug, Clone, Serialize)]
pub struct SubQueryInfo {
    pub question: String,
    pub sql_queries: Vec<SqlQueryInfo>,
    pub tables_used: Option<Vec<String>>,
    pub query_type: Option<QueryType>,
    pub errors: Vec<ErrorRecord>,
    pub retry_count: u32,
    pub tool_invocations: Vec<ToolInvocation>,
    /// Self-assessed confidence, 0-10.
    pub confidence: u8,
    /// Last message produced by each node, keyed by node name. Carries
    /// cross-node context into later prompts.
    pub node_messages: HashMap<String, String>,
}

impl SubQueryInfo {
    pub fn new(question: String) -> Self {
        Self {
            question,
            sql_queries: Vec::new(),
            tables_used: None,
            query_type: None,
            errors: Vec::new(),
            retry_count: 0,
            tool_invocations: Vec::new(),
            confidence: 5,
            node_messages: HashMap::new(),
        }
    }

    pub fn record_error(&mut self, origin: &str, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            origin: origin.to_string(),
            message: message.into(),
        });
    }

    pub fn set_node_message(&mut self, node: &str, message: impl Into<String>) {
        self.node_messages.insert(node.to_string(), message.into());
    }

    /// Bump the retry counter and dock confidence for the extra attempt.
    pub fn note_retry(&mut self) {
        self.retry_count += 1;
        self.confidence = self.confidence.saturating_sub(1);
    }

    /// Formatted error history for retry prompts, oldest first.
    pub fn error_history(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("[{}] {}", e.origin, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_rows(&self) -> bool {
        self.sql_queries
            .iter()
            .any(|q| q.row_count() > 0 || q.summary.is_some())
    }
}

/// The full record for one client request.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub subqueries: Vec<SubQueryInfo>,
    #[serde(skip)]
    start: Instant,
}

impl QueryResult {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            started_at: Utc::now(),
            subqueries: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Append a sub-query; it becomes the current one.
    pub fn push_subquery(&mut self, question: impl Into<String>) -> &mut SubQueryInfo {
        self.subqueries.push(SubQueryInfo::new(question.into()));
        self.subqueries.last_mut().unwrap()
    }

    /// The sub-query currently being processed (always the last element).
    pub fn current_mut(&mut self) -> Option<&mut SubQueryInfo> {
        self.subqueries.last_mut()
    }

    pub fn current(&self) -> Option<&SubQueryInfo> {
        self.subqueries.last()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Whether any sub-query was classified as a data query.
    pub fn has_data_query(&self) -> bool {
        self.subqueries
            .iter()
            .any(|s| s.query_type == Some(QueryType::DataQuery))
    }

    /// Whether any SQL result rows (raw or summarized) exist anywhere.
    pub fn has_any_rows(&self) -> bool {
        self.subqueries.iter().any(|s| s.has_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_last_appended() {
        let mut result = QueryResult::new("q");
        result.push_subquery("a");
        result.push_subquery("b");
        assert_eq!(result.current().unwrap().question, "b");
        assert_eq!(result.subqueries.len(), 2);
    }

    #[test]
    fn test_rows_xor_summary_after_summarization() {
        let mut info = SqlQueryInfo::new("select 1".into(), "SELECT 1".into(), "test".into());
        let mut row = Row::new();
        row.insert("a".to_string(), serde_json::json!(1));
        info.record_rows(vec![row]);
        assert!(info.sql_query_result.is_some() && info.summary.is_none());

        info.apply_summary(ResultSummary::default());
        assert!(info.contains_large_results);
        assert!(info.sql_query_result.is_none() && info.summary.is_some());
    }

    #[test]
    fn test_note_retry_docks_confidence() {
        let mut sub = SubQueryInfo::new("q".into());
        assert_eq!(sub.confidence, 5);
        for _ in 0..7 {
            sub.note_retry();
        }
        assert_eq!(sub.retry_count, 7);
        assert_eq!(sub.confidence, 0); // floored
    }

    #[test]
    fn test_errors_are_append_only() {
        let mut sub = SubQueryInfo::new("q".into());
        sub.record_error("sql_executor", "boom");
        sub.record_error("sql_planner", "bad json");
        assert_eq!(sub.errors.len(), 2);
        assert!(sub.error_history().contains("[sql_executor] boom"));
    }
}
