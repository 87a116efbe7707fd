//! Subquery Planner
//!
//! Decides whether the user question must be split into independent
//! sub-questions. Two LLM calls: a breakdown assessment, then - only when
//! needed - the breakdown itself. Any failure degrades to treating the
//! original question as the single sub-query.

use crate::config::RunConfig;
use crate::error::Result;
use crate::llm::{clean_json_response, ChatMessage, ChatModel};
use crate::prompts;
use crate::query_result::QueryType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakdownAssessment {
    needs_breakdown: bool,
    #[serde(default = "default_query_type")]
    query_type: QueryType,
    #[serde(default)]
    reasoning: String,
    #[serde(default = "default_confidence")]
    confidence: u8,
}

fn default_query_type() -> QueryType {
    QueryType::DataQuery
}

fn default_confidence() -> u8 {
    5
}

#[derive(Debug, Clone, Deserialize)]
struct BreakdownOutput {
    #[serde(default)]
    sub_questions: Vec<String>,
}

/// Planner output: the ordered sub-questions plus the run classification.
#[derive(Debug, Clone)]
pub struct SubqueryPlan {
    pub sub_questions: Vec<String>,
    pub query_type: QueryType,
    pub confidence: u8,
    pub reasoning: String,
    /// Error text when the planner degraded to the single-question fallback.
    pub degraded: Option<String>,
}

pub struct SubqueryPlanner {
    llm: Arc<dyn ChatModel>,
}

impl SubqueryPlanner {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }

    /// Produce 1-3 sub-questions for the run. Never fails: LLM or parsing
    /// errors fall back to the original question as a single sub-query, with
    /// the failure noted in `degraded`.
    pub async fn plan(
        &self,
        question: &str,
        history: &[(String, String)],
        config: &RunConfig,
    ) -> SubqueryPlan {
        match self.try_plan(question, history, config).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Subquery planning degraded to single question: {}", e);
                SubqueryPlan {
                    sub_questions: vec![question.to_string()],
                    query_type: QueryType::DataQuery,
                    confidence: 5,
                    reasoning: String::new(),
                    degraded: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_plan(
        &self,
        question: &str,
        history: &[(String, String)],
        config: &RunConfig,
    ) -> Result<SubqueryPlan> {
        let prompt = prompts::breakdown_assessment(question, history);
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
        let assessment: BreakdownAssessment =
            serde_json::from_str(clean_json_response(&response.content))?;

        if !assessment.needs_breakdown {
            info!("No breakdown needed: {}", assessment.reasoning);
            return Ok(SubqueryPlan {
                sub_questions: vec![question.to_string()],
                query_type: assessment.query_type,
                confidence: assessment.confidence.min(10),
                reasoning: assessment.reasoning,
                degraded: None,
            });
        }

        let prompt = prompts::breakdown(question, history);
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
        let output: BreakdownOutput = serde_json::from_str(clean_json_response(&response.content))?;

        let mut sub_questions: Vec<String> = output
            .sub_questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        sub_questions.truncate(config.max_subqueries);

        // Empty breakdown output is a fallback, not an error.
        if sub_questions.is_empty() {
            sub_questions.push(question.to_string());
        }

        info!("Question split into {} sub-questions", sub_questions.len());
        Ok(SubqueryPlan {
            sub_questions,
            query_type: assessment.query_type,
            confidence: assessment.confidence.min(10),
            reasoning: assessment.reasoning,
            degraded: None,
        })
    }
}
