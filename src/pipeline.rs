//! Query Pipeline
//!
//! Drives one client request through the node state machine: subquery
//! planning, then per sub-question dataset selection, SQL planning, execution
//! and the replan loop, and finally answer synthesis. The pipeline is the
//! single writer of the run's `QueryResult` and emits lifecycle events around
//! every node so the streaming layer can narrate progress.
//!
//! A run never surfaces an error to the caller: terminal failures produce an
//! apologetic final message through the normal event stream, and the raw
//! error text stays in the sub-query error list and the logs.

use crate::config::RunConfig;
use crate::events::{EventSink, NodePayload};
use crate::llm::{ChatModel, ToolDefinition};
use crate::nodes::dataset_selector::{DatasetSelection, DatasetSelector, SelectorOutcome};
use crate::nodes::execution::QueryExecution;
use crate::nodes::replan::{ReplanRouter, RouteDecision};
use crate::nodes::sql_planner::{format_sql_for_display, SqlPlanner};
use crate::nodes::subquery_planner::SubqueryPlanner;
use crate::nodes::synthesizer::{FinalAnswer, ResultSynthesizer};
use crate::nodes::{
    DATASET_SELECTOR, REPLAN_ROUTER, RESPONSE_SYNTHESIZER, SQL_EXECUTOR, SQL_PLANNER,
    SUBQUERY_PLANNER,
};
use crate::observability::execution_log::{ExecutionLogStore, RunLogEntry};
use crate::query_result::{QueryResult, QueryType, SqlQueryInfo, ToolInvocation};
use crate::search::DatasetSearch;
use crate::sql_exec::SqlExecutor;
use std::sync::Arc;
use tracing::{info, warn};

/// One client request.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    /// Prior conversation turns as (role, content) pairs.
    pub history: Vec<(String, String)>,
    pub project_ids: Option<Vec<String>>,
    pub dataset_ids: Option<Vec<String>>,
    /// Informational model override; provider selection happens outside.
    pub model: Option<String>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub result: QueryResult,
    pub answer: FinalAnswer,
}

/// Sub-query phase machine. Execution failures loop back through the router
/// to dataset selection or SQL planning.
enum Phase {
    SelectDatasets,
    PlanSql,
    Execute { from_index: usize },
    Done,
}

pub struct QueryPipeline {
    subquery_planner: SubqueryPlanner,
    dataset_selector: DatasetSelector,
    sql_planner: SqlPlanner,
    execution: QueryExecution,
    router: ReplanRouter,
    synthesizer: ResultSynthesizer,
    config: RunConfig,
    log_store: Arc<ExecutionLogStore>,
}

impl QueryPipeline {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        search: Arc<dyn DatasetSearch>,
        executor: Arc<dyn SqlExecutor>,
        config: RunConfig,
    ) -> Self {
        Self {
            subquery_planner: SubqueryPlanner::new(Arc::clone(&llm)),
            dataset_selector: DatasetSelector::new(Arc::clone(&llm), search),
            sql_planner: SqlPlanner::new(Arc::clone(&llm)),
            execution: QueryExecution::new(executor),
            router: ReplanRouter::new(Arc::clone(&llm)),
            synthesizer: ResultSynthesizer::new(llm),
            config,
            log_store: Arc::new(ExecutionLogStore::default()),
        }
    }

    pub fn with_log_store(mut self, log_store: Arc<ExecutionLogStore>) -> Self {
        self.log_store = log_store;
        self
    }

    /// Tools offered to the synthesizer on conversational runs.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.synthesizer = self.synthesizer.with_tools(tools);
        self
    }

    pub fn log_store(&self) -> Arc<ExecutionLogStore> {
        Arc::clone(&self.log_store)
    }

    /// Run one request to completion.
    pub async fn run(&self, request: QueryRequest, events: EventSink) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, question = %request.question, "Starting query run");
        let mut result = QueryResult::new(&request.question);

        // Subquery planning. Never fails; degrades to the single question.
        events.node_start(SUBQUERY_PLANNER);
        let plan = self
            .subquery_planner
            .plan(&request.question, &request.history, &self.config)
            .await;
        if plan.sub_questions.len() > 1 {
            events.node_delta(
                SUBQUERY_PLANNER,
                format!(
                    "Splitting this into {} separate questions.",
                    plan.sub_questions.len()
                ),
            );
        }
        events.node_end(SUBQUERY_PLANNER);

        for sub_question in &plan.sub_questions {
            {
                let sub = result.push_subquery(sub_question.clone());
                sub.query_type = Some(plan.query_type);
                sub.confidence = plan.confidence;
                if !plan.reasoning.is_empty() {
                    sub.set_node_message(SUBQUERY_PLANNER, plan.reasoning.clone());
                }
                if let Some(ref degraded) = plan.degraded {
                    sub.record_error(SUBQUERY_PLANNER, degraded.clone());
                }
            }
            if plan.query_type == QueryType::DataQuery {
                self.run_subquery(&mut result, sub_question, &request, &events)
                    .await;
            }
        }

        let answer = self.synthesize(&mut result, &request, &events).await;

        let success = result.subqueries.iter().all(|s| s.errors.is_empty());
        self.log_store
            .record(RunLogEntry::from_result(&run_id, &result, success));
        info!(run_id = %run_id, elapsed_ms = answer.elapsed_ms, "Run complete");

        RunOutcome {
            run_id,
            result,
            answer,
        }
    }

    /// The per-sub-question state machine: select -> plan -> execute, with
    /// router-driven loops back to selection or planning on failure.
    async fn run_subquery(
        &self,
        result: &mut QueryResult,
        question: &str,
        request: &QueryRequest,
        events: &EventSink,
    ) {
        let mut selection: Option<DatasetSelection> = None;
        let mut phase = Phase::SelectDatasets;

        loop {
            match phase {
                Phase::SelectDatasets => {
                    events.node_start(DATASET_SELECTOR);
                    let outcome = self
                        .dataset_selector
                        .select(
                            question,
                            request.project_ids.as_deref(),
                            request.dataset_ids.as_deref(),
                            &self.config,
                        )
                        .await;
                    let sub = result.current_mut().expect("subquery was just pushed");
                    match outcome {
                        Ok(SelectorOutcome::Selected(selected)) => {
                            let names: Vec<String> =
                                selected.schemas.iter().map(|s| s.name.clone()).collect();
                            sub.tables_used = Some(
                                selected
                                    .schemas
                                    .iter()
                                    .map(|s| s.dataset_name.clone())
                                    .collect(),
                            );
                            let message = if selected.reasoning.is_empty() {
                                format!("Using datasets: {}", names.join(", "))
                            } else {
                                selected.reasoning.clone()
                            };
                            sub.set_node_message(DATASET_SELECTOR, message.clone());
                            events.node_delta(DATASET_SELECTOR, message);
                            events.node_end_with(
                                DATASET_SELECTOR,
                                NodePayload {
                                    datasets_used: Some(names),
                                    generated_sql: None,
                                    error: None,
                                },
                            );
                            selection = Some(selected);
                            phase = Phase::PlanSql;
                        }
                        Ok(SelectorOutcome::NoDatasets { message }) => {
                            // Terminal for this sub-query: straight to
                            // synthesis, no SQL is ever planned.
                            sub.set_node_message(DATASET_SELECTOR, message.clone());
                            events.node_delta(DATASET_SELECTOR, message);
                            events.node_end(DATASET_SELECTOR);
                            phase = Phase::Done;
                        }
                        Err(e) => {
                            let message = e.to_string();
                            sub.record_error(DATASET_SELECTOR, message.clone());
                            events.node_end_with(
                                DATASET_SELECTOR,
                                NodePayload {
                                    datasets_used: None,
                                    generated_sql: None,
                                    error: Some(message.clone()),
                                },
                            );
                            phase = self
                                .route(result, &message, selection.is_some(), events)
                                .await;
                        }
                    }
                }
                Phase::PlanSql => {
                    events.node_start(SQL_PLANNER);
                    let current_selection =
                        selection.as_ref().expect("planning requires a selection");
                    let error_context = result
                        .current()
                        .map(|s| s.error_history())
                        .unwrap_or_default();
                    let outcome = self
                        .sql_planner
                        .plan(question, current_selection, &error_context, &self.config)
                        .await;
                    let sub = result.current_mut().expect("subquery was just pushed");
                    match outcome {
                        Ok(plan) => {
                            sub.set_node_message(
                                SQL_PLANNER,
                                format!(
                                    "strategy={:?} tables={:?} {}",
                                    plan.strategy, plan.tables_used, plan.reasoning
                                ),
                            );
                            if !plan.tables_used.is_empty() {
                                sub.tables_used = Some(plan.tables_used.clone());
                            }
                            let from_index = sub.sql_queries.len();
                            let mut display = Vec::new();
                            for query in plan.queries {
                                let formatted = format_sql_for_display(&query.sql);
                                display.push(formatted.clone());
                                sub.sql_queries.push(SqlQueryInfo::new(
                                    query.sql,
                                    formatted,
                                    query.explanation,
                                ));
                            }
                            events.node_delta(
                                SQL_PLANNER,
                                format!(
                                    "Prepared {} quer{}.",
                                    display.len(),
                                    if display.len() == 1 { "y" } else { "ies" }
                                ),
                            );
                            events.node_end_with(
                                SQL_PLANNER,
                                NodePayload {
                                    datasets_used: None,
                                    generated_sql: Some(display),
                                    error: None,
                                },
                            );
                            phase = Phase::Execute { from_index };
                        }
                        Err(e) => {
                            let message = e.to_string();
                            sub.record_error(SQL_PLANNER, message.clone());
                            events.node_end_with(
                                SQL_PLANNER,
                                NodePayload {
                                    datasets_used: None,
                                    generated_sql: None,
                                    error: Some(message.clone()),
                                },
                            );
                            phase = self.route(result, &message, true, events).await;
                        }
                    }
                }
                Phase::Execute { from_index } => {
                    events.node_start(SQL_EXECUTOR);
                    let sub = result.current_mut().expect("subquery was just pushed");
                    let outcome = self.execution.run(sub, from_index, &self.config).await;
                    match outcome.first_error {
                        None => {
                            events.node_delta(SQL_EXECUTOR, "Queries ran successfully.");
                            events.node_end(SQL_EXECUTOR);
                            phase = Phase::Done;
                        }
                        Some(error) => {
                            sub.record_error(SQL_EXECUTOR, error.clone());
                            events.node_end_with(
                                SQL_EXECUTOR,
                                NodePayload {
                                    datasets_used: None,
                                    generated_sql: None,
                                    error: Some(error.clone()),
                                },
                            );
                            phase = self.route(result, &error, true, events).await;
                        }
                    }
                }
                Phase::Done => break,
            }

            if matches!(phase, Phase::SelectDatasets) {
                // Reidentification discards the previous selection.
                selection = None;
            }
        }
    }

    /// Ask the router where to go after a failure.
    async fn route(
        &self,
        result: &mut QueryResult,
        error: &str,
        has_selection: bool,
        events: &EventSink,
    ) -> Phase {
        events.node_start(REPLAN_ROUTER);
        let sub = result.current_mut().expect("subquery was just pushed");
        let decision = self.router.route(sub, error, &self.config).await;
        events.node_end(REPLAN_ROUTER);
        match decision {
            RouteDecision::ReidentifyDatasets => Phase::SelectDatasets,
            // Replanning without a selection can only start over.
            RouteDecision::Replan if has_selection => Phase::PlanSql,
            RouteDecision::Replan => Phase::SelectDatasets,
            RouteDecision::ValidateQueryResult => Phase::Done,
        }
    }

    /// Produce and stream the final message. Synthesis failures degrade to an
    /// apologetic message through the same stream.
    async fn synthesize(
        &self,
        result: &mut QueryResult,
        request: &QueryRequest,
        events: &EventSink,
    ) -> FinalAnswer {
        events.node_start(RESPONSE_SYNTHESIZER);
        let answer = match self.synthesizer.synthesize(result, &request.history).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Synthesis failed: {}", e);
                if let Some(sub) = result.current_mut() {
                    sub.record_error(RESPONSE_SYNTHESIZER, e.to_string());
                }
                FinalAnswer {
                    text: "I'm sorry - I ran into a problem while putting the answer together. \
                           Please try asking again in a moment."
                        .to_string(),
                    elapsed_ms: result.elapsed_ms(),
                    tool_calls: Vec::new(),
                }
            }
        };

        for tool_call in &answer.tool_calls {
            events.tool_start(RESPONSE_SYNTHESIZER, tool_call.name.clone());
            if let Some(sub) = result.current_mut() {
                sub.tool_invocations.push(ToolInvocation {
                    tool_name: tool_call.name.clone(),
                    arguments: tool_call.arguments.clone(),
                    output: None,
                });
            }
            events.tool_end(RESPONSE_SYNTHESIZER, tool_call.name.clone(), None);
        }

        if !answer.text.is_empty() {
            events.node_delta(RESPONSE_SYNTHESIZER, answer.text.clone());
        }
        events.node_end(RESPONSE_SYNTHESIZER);
        answer
    }
}
