//! SQL Planner
//!
//! Turns a sub-question plus selected dataset schemas into one joined SQL
//! statement or several independent ones. Every generated statement passes a
//! read-only guard before it reaches the executor, and gets a
//! keyword-uppercased display variant for the UI.

use crate::config::RunConfig;
use crate::error::{PilotError, Result};
use crate::llm::{clean_json_response, ChatMessage, ChatModel};
use crate::nodes::dataset_selector::DatasetSelection;
use crate::prompts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::info;

/// Whether the planner joined the datasets or emitted independent statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    SingleQuery,
    MultipleQueries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub sql: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PlannerOutput {
    strategy: Option<PlanStrategy>,
    queries: Option<Vec<PlannedQuery>>,
    #[serde(default)]
    tables_used: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Validated plan for one sub-question attempt.
#[derive(Debug, Clone)]
pub struct SqlPlan {
    pub strategy: PlanStrategy,
    pub queries: Vec<PlannedQuery>,
    pub tables_used: Vec<String>,
    pub reasoning: String,
}

pub struct SqlPlanner {
    llm: Arc<dyn ChatModel>,
}

impl SqlPlanner {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }

    /// Generate and validate SQL for a sub-question. Malformed LLM output and
    /// non-read statements surface as planning errors for the replan router.
    pub async fn plan(
        &self,
        question: &str,
        selection: &DatasetSelection,
        error_context: &str,
        config: &RunConfig,
    ) -> Result<SqlPlan> {
        let prompt = prompts::sql_planning(
            question,
            &selection.schemas,
            &selection.render_hints(),
            error_context,
            &config.sql_constraints,
        );
        let response = self
            .llm
            .invoke(
                &[
                    ChatMessage::system("Return JSON only, no text."),
                    ChatMessage::user(prompt),
                ],
                None,
            )
            .await?;

        let output: PlannerOutput = serde_json::from_str(clean_json_response(&response.content))
            .map_err(|e| PilotError::Planning(format!("Malformed SQL plan JSON: {}", e)))?;

        let strategy = output
            .strategy
            .ok_or_else(|| PilotError::Planning("SQL plan missing 'strategy'".to_string()))?;
        let queries = output
            .queries
            .filter(|q| !q.is_empty())
            .ok_or_else(|| PilotError::Planning("SQL plan has no queries".to_string()))?;

        for query in &queries {
            ensure_read_only(&query.sql)?;
        }

        info!(
            "Planned {} statement(s) with strategy {:?}",
            queries.len(),
            strategy
        );
        Ok(SqlPlan {
            strategy,
            queries,
            tables_used: output.tables_used,
            reasoning: output.reasoning,
        })
    }
}

/// Reject anything that is not exactly one plain SELECT query.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| PilotError::Planning(format!("Generated SQL does not parse: {}", e)))?;
    if statements.len() != 1 {
        return Err(PilotError::Planning(format!(
            "Expected one statement, got {}",
            statements.len()
        )));
    }
    match &statements[0] {
        Statement::Query(_) => Ok(()),
        other => Err(PilotError::Planning(format!(
            "Only read queries are allowed, got: {}",
            statement_kind(other)
        ))),
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE TABLE",
        _ => "non-query statement",
    }
}

lazy_static::lazy_static! {
    static ref SQL_KEYWORD: Regex = Regex::new(
        r"(?i)\b(select|from|where|group by|order by|having|limit|offset|join|inner|left|right|full|outer|cross|on|as|and|or|not|in|is|null|case|when|then|else|end|union|all|distinct|with|count|sum|avg|min|max|lower|upper|coalesce|cast|between|asc|desc)\b"
    ).unwrap();
}

/// Uppercase SQL keywords outside quoted literals for display.
pub fn format_sql_for_display(sql: &str) -> String {
    // Split on single quotes; even segments are outside string literals.
    sql.split('\'')
        .enumerate()
        .map(|(i, segment)| {
            if i % 2 == 0 {
                SQL_KEYWORD
                    .replace_all(segment, |caps: &regex::Captures| {
                        caps[0].to_uppercase()
                    })
                    .into_owned()
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("'")
}
