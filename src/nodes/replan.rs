//! Replan Router
//!
//! On execution failure, classifies the error into one of three remediation
//! paths and drives the retry loop. The retry ceiling is a hard circuit
//! breaker: once a sub-query has used its budget, the router returns
//! `ValidateQueryResult` without consulting the model.

use crate::config::RunConfig;
use crate::error::Result;
use crate::llm::{clean_json_response, ChatMessage, ChatModel};
use crate::nodes;
use crate::prompts;
use crate::query_result::SubQueryInfo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// The three remediation paths. `ValidateQueryResult` means "stop retrying",
/// not "the result is good".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    ReidentifyDatasets,
    Replan,
    ValidateQueryResult,
}

#[derive(Debug, Clone, Deserialize)]
struct RouterOutput {
    // Unrecognized tags deserialize to None and resolve to validation,
    // never to a retry path.
    #[serde(default, deserialize_with = "lenient_decision")]
    decision: Option<RouteDecision>,
    #[serde(default)]
    reasoning: String,
}

fn lenient_decision<'de, D>(deserializer: D) -> std::result::Result<Option<RouteDecision>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| match s.as_str() {
        "reidentify_datasets" => Some(RouteDecision::ReidentifyDatasets),
        "replan" => Some(RouteDecision::Replan),
        "validate_query_result" => Some(RouteDecision::ValidateQueryResult),
        _ => None,
    }))
}

pub struct ReplanRouter {
    llm: Arc<dyn ChatModel>,
}

impl ReplanRouter {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }

    /// Route after a failed attempt. Increments the sub-query's retry counter
    /// when (and only when) a retry path is taken.
    pub async fn route(
        &self,
        subquery: &mut SubQueryInfo,
        error: &str,
        config: &RunConfig,
    ) -> RouteDecision {
        if subquery.retry_count >= config.max_retries {
            warn!(
                "Retry ceiling ({}) reached, forcing validation",
                config.max_retries
            );
            subquery.set_node_message(
                nodes::REPLAN_ROUTER,
                "Retry budget exhausted; proceeding with what was obtained.",
            );
            return RouteDecision::ValidateQueryResult;
        }

        let decision = match self.classify(subquery, error).await {
            Ok((decision, reasoning)) => {
                subquery.set_node_message(nodes::REPLAN_ROUTER, reasoning);
                decision
            }
            Err(e) => {
                // A broken classifier must not burn the retry budget forever.
                warn!("Route classification failed ({}), validating", e);
                subquery.record_error(nodes::REPLAN_ROUTER, e.to_string());
                RouteDecision::ValidateQueryResult
            }
        };

        match decision {
            RouteDecision::ReidentifyDatasets | RouteDecision::Replan => {
                subquery.note_retry();
                info!(
                    "Routing to {:?} (retry {}/{})",
                    decision, subquery.retry_count, config.max_retries
                );
            }
            RouteDecision::ValidateQueryResult => {
                info!("Routing to validation");
            }
        }
        decision
    }

    async fn classify(
        &self,
        subquery: &SubQueryInfo,
        error: &str,
    ) -> Result<(RouteDecision, String)> {
        let node_context = subquery
            .node_messages
            .iter()
            .map(|(node, message)| format!("{}: {}", node, message))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = prompts::replan_classification(error, &subquery.error_history(), &node_context);
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
        let output: RouterOutput = serde_json::from_str(clean_json_response(&response.content))?;
        let decision = output.decision.unwrap_or_else(|| {
            warn!("Unrecognized route tag, defaulting to validation");
            RouteDecision::ValidateQueryResult
        });
        Ok((decision, output.reasoning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<LlmResponse> {
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| r#"{"decision": "validate_query_result"}"#.to_string());
            Ok(LlmResponse {
                content,
                tool_calls: vec![],
            })
        }
    }

    fn router_with(responses: Vec<String>) -> ReplanRouter {
        ReplanRouter::new(Arc::new(ScriptedModel {
            responses: Mutex::new(responses),
        }))
    }

    #[tokio::test]
    async fn test_replan_increments_retry_counter() {
        let router = router_with(vec![
            r#"{"decision": "replan", "reasoning": "bad join"}"#.to_string()
        ]);
        let mut sub = SubQueryInfo::new("q".to_string());
        let decision = router.route(&mut sub, "syntax error", &RunConfig::default()).await;
        assert_eq!(decision, RouteDecision::Replan);
        assert_eq!(sub.retry_count, 1);
    }

    #[tokio::test]
    async fn test_ceiling_forces_validation_without_llm() {
        // Scripted replies would pick a retry path; the ceiling must win.
        let router = router_with(vec![r#"{"decision": "replan"}"#.to_string()]);
        let config = RunConfig::default();
        let mut sub = SubQueryInfo::new("q".to_string());
        sub.retry_count = config.max_retries;
        let decision = router.route(&mut sub, "err", &config).await;
        assert_eq!(decision, RouteDecision::ValidateQueryResult);
        assert_eq!(sub.retry_count, config.max_retries); // not incremented
    }

    #[tokio::test]
    async fn test_unknown_tag_defaults_to_validation() {
        let router = router_with(vec![
            r#"{"decision": "try_harder", "reasoning": "??"}"#.to_string()
        ]);
        let mut sub = SubQueryInfo::new("q".to_string());
        let decision = router.route(&mut sub, "err", &RunConfig::default()).await;
        assert_eq!(decision, RouteDecision::ValidateQueryResult);
        assert_eq!(sub.retry_count, 0);
    }

    #[tokio::test]
    async fn test_reidentify_counts_toward_budget() {
        let config = RunConfig::default();
        let router = router_with(vec![
            r#"{"decision": "replan"}"#.to_string(),
            r#"{"decision": "reidentify_datasets"}"#.to_string(),
        ]);
        let mut sub = SubQueryInfo::new("q".to_string());
        assert_eq!(
            router.route(&mut sub, "err", &config).await,
            RouteDecision::ReidentifyDatasets
        );
        assert_eq!(
            router.route(&mut sub, "err", &config).await,
            RouteDecision::Replan
        );
        assert_eq!(sub.retry_count, 2);
        // Budget spent: the next failure must validate regardless of advice.
        assert_eq!(
            router.route(&mut sub, "err", &config).await,
            RouteDecision::ValidateQueryResult
        );
    }
}
