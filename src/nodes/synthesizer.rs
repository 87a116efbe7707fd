//! Result Synthesizer
//!
//! Produces the final natural-language answer from the accumulated run
//! record. Three branches: a data-grounded answer when rows exist, an
//! empty-results answer with rephrasing suggestions when a data question
//! found nothing, and a conversational answer when no sub-query needed data.

use crate::error::Result;
use crate::llm::{ChatMessage, ChatModel, ToolCallRequest, ToolDefinition};
use crate::prompts;
use crate::query_result::QueryResult;
use std::sync::Arc;
use tracing::info;

/// The run's final message.
#[derive(Debug, Clone)]
pub struct FinalAnswer {
    pub text: String,
    pub elapsed_ms: u64,
    /// Tool calls the model chose to make instead of (or alongside) text;
    /// only possible on the conversational branch.
    pub tool_calls: Vec<ToolCallRequest>,
}

pub struct ResultSynthesizer {
    llm: Arc<dyn ChatModel>,
    tools: Vec<ToolDefinition>,
}

impl ResultSynthesizer {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self {
            llm,
            tools: Vec::new(),
        }
    }

    /// Tools offered to the model on conversational/tool-only runs.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub async fn synthesize(
        &self,
        result: &QueryResult,
        history: &[(String, String)],
    ) -> Result<FinalAnswer> {
        let (prompt, tools) = if !result.has_data_query() {
            info!("Synthesizing conversational answer");
            let tools = if self.tools.is_empty() {
                None
            } else {
                Some(self.tools.as_slice())
            };
            (prompts::conversational(&result.question, history), tools)
        } else if result.has_any_rows() {
            info!("Synthesizing data-grounded answer");
            (
                prompts::data_answer(&result.question, &render_evidence(result), history),
                None,
            )
        } else {
            info!("Synthesizing empty-results answer");
            (
                prompts::empty_results(&result.question, &render_attempts(result)),
                None,
            )
        };

        let response = self
            .llm
            .invoke(
                &[
                    ChatMessage::system(
                        "You answer strictly from provided evidence. Never invent data.",
                    ),
                    ChatMessage::user(prompt),
                ],
                tools,
            )
            .await?;

        Ok(FinalAnswer {
            text: response.content,
            elapsed_ms: result.elapsed_ms(),
            tool_calls: response.tool_calls,
        })
    }
}

/// Render every sub-query's evidence: raw rows when present, the bounded
/// summary otherwise, and error notes so partial failures are acknowledged.
fn render_evidence(result: &QueryResult) -> String {
    let mut parts = Vec::new();
    for subquery in &result.subqueries {
        parts.push(format!("Sub-question: {}", subquery.question));
        for info in &subquery.sql_queries {
            parts.push(format!("Query purpose: {}", info.explanation));
            if let Some(ref rows) = info.sql_query_result {
                parts.push(format!(
                    "Rows ({}):\n{}",
                    rows.len(),
                    serde_json::to_string(rows).unwrap_or_default()
                ));
            } else if let Some(ref summary) = info.summary {
                parts.push(format!(
                    "Summarized result ({} rows, {} columns):\n{}",
                    summary.row_count,
                    summary.column_count,
                    serde_json::to_string(summary).unwrap_or_default()
                ));
            } else if let Some(ref error) = info.error {
                parts.push(format!("This query failed and produced no data: {}", error));
            }
        }
        if subquery.sql_queries.is_empty() {
            if let Some(message) = subquery.node_messages.get(crate::nodes::DATASET_SELECTOR) {
                parts.push(format!("Note: {}", message));
            }
        }
    }
    parts.join("\n")
}

/// Non-technical description of what was tried, for the empty-results branch.
fn render_attempts(result: &QueryResult) -> String {
    let mut parts = Vec::new();
    for subquery in &result.subqueries {
        let attempted = subquery.sql_queries.len();
        let failed = subquery.sql_queries.iter().filter(|q| !q.success).count();
        parts.push(format!(
            "\"{}\": {} quer{} attempted, {} failed, {} retr{}",
            subquery.question,
            attempted,
            if attempted == 1 { "y" } else { "ies" },
            failed,
            subquery.retry_count,
            if subquery.retry_count == 1 { "y" } else { "ies" },
        ));
        if let Some(ref tables) = subquery.tables_used {
            parts.push(format!("  looked in: {}", tables.join(", ")));
        }
    }
    parts.join("\n")
}
