//! End-to-end pipeline scenarios with scripted collaborators.

use async_trait::async_trait;
use datapilot::config::RunConfig;
use datapilot::error::{PilotError, Result};
use datapilot::events::EventSink;
use datapilot::llm::{ChatMessage, ChatModel, LlmResponse, ToolDefinition};
use datapilot::pipeline::{QueryPipeline, QueryRequest};
use datapilot::query_result::{QueryType, Row};
use datapilot::search::{ColumnSchema, DatasetSchema, DatasetSearch};
use datapilot::sql_exec::SqlExecutor;
use datapilot::stream::native::NativeSseAdapter;
use datapilot::stream::openai::OpenAiStreamAdapter;
use datapilot::stream::translator::EventTranslator;
use std::sync::{Arc, Mutex};

/// Dispatches canned replies by recognizing which node's prompt arrived, and
/// records the node kinds consulted.
struct FakeModel {
    assessment: String,
    selection: String,
    sql_plan: String,
    route: String,
    answer: String,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeModel {
    fn new() -> Self {
        Self {
            assessment: r#"{"needs_breakdown": false, "query_type": "data_query", "reasoning": "one ask", "confidence": 7}"#.to_string(),
            selection: String::new(),
            sql_plan: String::new(),
            route: r#"{"decision": "replan", "reasoning": "query needs work"}"#.to_string(),
            answer: "answer text".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn consulted(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl ChatModel for FakeModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        let prompt = messages
            .last()
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let (kind, content) = if prompt.contains("must be split into independent sub-questions") {
            ("assessment", self.assessment.clone())
        } else if prompt.contains("Split the user question") {
            ("breakdown", r#"{"sub_questions": []}"#.to_string())
        } else if prompt.contains("Pick the datasets needed") {
            ("selection", self.selection.clone())
        } else if prompt.contains("Write SQL to answer the question") {
            ("sql_plan", self.sql_plan.clone())
        } else if prompt.contains("Classify the failure") {
            ("route", self.route.clone())
        } else if prompt.contains("Answer the user's question from the evidence") {
            ("data_answer", self.answer.clone())
        } else if prompt.contains("returned no rows") {
            ("empty_answer", self.answer.clone())
        } else if prompt.contains("needs no data query") {
            ("conversational", self.answer.clone())
        } else {
            ("unknown", "{}".to_string())
        };
        self.calls.lock().unwrap().push(kind);
        Ok(LlmResponse {
            content,
            tool_calls: vec![],
        })
    }
}

struct FakeSearch {
    datasets: Vec<DatasetSchema>,
}

#[async_trait]
impl DatasetSearch for FakeSearch {
    async fn search(
        &self,
        _query: &str,
        _embedding_model: &str,
        _project_ids: Option<&[String]>,
        _dataset_ids: Option<&[String]>,
        _top_k: usize,
    ) -> Result<Vec<DatasetSchema>> {
        Ok(self.datasets.clone())
    }
}

/// Scriptable executor: pops outcomes front-to-back, repeating the last one.
struct FakeExecutor {
    script: Mutex<Vec<std::result::Result<Vec<Row>, String>>>,
    calls: Mutex<usize>,
}

impl FakeExecutor {
    fn new(script: Vec<std::result::Result<Vec<Row>, String>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(0),
        }
    }

    fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SqlExecutor for FakeExecutor {
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>> {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        let outcome = if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap_or(Ok(vec![]))
        };
        outcome.map_err(PilotError::Execution)
    }
}

fn sales_dataset() -> DatasetSchema {
    DatasetSchema {
        name: "Sales".to_string(),
        dataset_name: "tbl_sales_v2".to_string(),
        dataset_description: "Revenue per region".to_string(),
        columns: vec![
            ColumnSchema {
                name: "region".to_string(),
                data_type: "varchar".to_string(),
                sample_values: vec![serde_json::json!("North"), serde_json::json!("South")],
                stats: None,
            },
            ColumnSchema {
                name: "revenue".to_string(),
                data_type: "double".to_string(),
                sample_values: vec![serde_json::json!(100.0)],
                stats: None,
            },
        ],
    }
}

fn revenue_row(region: &str, revenue: f64) -> Row {
    let mut row = Row::new();
    row.insert("region".to_string(), serde_json::json!(region));
    row.insert("revenue".to_string(), serde_json::json!(revenue));
    row
}

fn pipeline_with(
    model: Arc<FakeModel>,
    search: FakeSearch,
    executor: Arc<FakeExecutor>,
) -> QueryPipeline {
    QueryPipeline::new(
        model,
        Arc::new(search),
        executor,
        RunConfig::default(),
    )
}

#[tokio::test]
async fn scenario_a_happy_path_single_dataset() {
    let mut model = FakeModel::new();
    model.selection = r#"{"datasets": [{"name": "Sales", "columns": [{"name": "region", "exact_values": [], "fuzzy_values": []}]}], "reasoning": "sales has revenue by region"}"#.to_string();
    model.sql_plan = r#"{"strategy": "single_query", "queries": [{"sql": "select region, sum(revenue) from tbl_sales_v2 group by region", "explanation": "revenue per region"}], "tables_used": ["tbl_sales_v2"], "reasoning": "one table"}"#.to_string();
    model.answer = "North leads with 1500, South follows with 900.".to_string();
    let model = Arc::new(model);
    let executor = Arc::new(FakeExecutor::new(vec![Ok(vec![
        revenue_row("North", 1500.0),
        revenue_row("South", 900.0),
    ])]));

    let pipeline = pipeline_with(
        Arc::clone(&model),
        FakeSearch {
            datasets: vec![sales_dataset()],
        },
        Arc::clone(&executor),
    );

    let (sink, mut rx) = EventSink::channel();
    let outcome = pipeline
        .run(
            QueryRequest {
                question: "What is total revenue by region?".to_string(),
                ..Default::default()
            },
            sink,
        )
        .await;

    // One sub-query, one statement, success, raw rows kept.
    assert_eq!(outcome.result.subqueries.len(), 1);
    let sub = &outcome.result.subqueries[0];
    assert_eq!(sub.query_type, Some(QueryType::DataQuery));
    assert_eq!(sub.sql_queries.len(), 1);
    let info = &sub.sql_queries[0];
    assert!(info.success);
    assert!(!info.contains_large_results);
    assert_eq!(info.row_count(), 2);
    assert!(info.display_sql.contains("SELECT"));
    assert_eq!(sub.retry_count, 0);

    // Final answer references region-level figures.
    assert!(outcome.answer.text.contains("North"));
    assert!(outcome.answer.text.contains("1500"));

    // Native stream: answer delta present, generated SQL in the side channel,
    // internal router node invisible.
    let adapter = NativeSseAdapter::new(Some("chat".to_string()), None);
    let mut translator = EventTranslator::new();
    let mut frames = Vec::new();
    while let Ok(event) = rx.try_recv() {
        for chunk in translator.translate(&event) {
            if let Some(frame) = adapter.frame(&chunk) {
                frames.push(frame);
            }
        }
    }
    assert!(frames.iter().any(|f| f.contains("North leads")));
    assert!(frames.iter().any(|f| f.contains("generated_sql_query")));
    assert!(!frames.iter().any(|f| f.contains("replan_router")));
    assert_eq!(model.consulted("route"), 0);
}

#[tokio::test]
async fn scenario_b_retry_twice_then_forced_validation() {
    let mut model = FakeModel::new();
    model.selection = r#"{"datasets": [{"name": "Sales", "columns": []}], "reasoning": "sales"}"#.to_string();
    model.sql_plan = r#"{"strategy": "single_query", "queries": [{"sql": "select bad_column from tbl_sales_v2", "explanation": "attempt"}], "tables_used": ["tbl_sales_v2"], "reasoning": "retry"}"#.to_string();
    model.route = r#"{"decision": "replan", "reasoning": "bad column"}"#.to_string();
    model.answer = "I could not complete the analysis for this question.".to_string();
    let model = Arc::new(model);
    let executor = Arc::new(FakeExecutor::new(vec![Err(
        "column \"bad_column\" does not exist".to_string(),
    )]));

    let pipeline = pipeline_with(
        Arc::clone(&model),
        FakeSearch {
            datasets: vec![sales_dataset()],
        },
        Arc::clone(&executor),
    );

    let outcome = pipeline
        .run(
            QueryRequest {
                question: "sum of bad column?".to_string(),
                ..Default::default()
            },
            EventSink::disabled(),
        )
        .await;

    let config = RunConfig::default();
    let sub = &outcome.result.subqueries[0];

    // Retry ceiling honored: exactly max_retries replan transitions, then the
    // router is forced to validate without consulting the model again.
    assert_eq!(sub.retry_count, config.max_retries);
    assert_eq!(model.consulted("route") as u32, config.max_retries);
    assert_eq!(executor.call_count() as u32, config.max_retries + 1);

    // Every failure is on record; nothing was discarded.
    assert!(sub.errors.len() as u32 >= config.max_retries + 1);

    // The user-facing answer acknowledges failure without raw error text.
    assert!(!outcome.answer.text.contains("bad_column"));
    assert!(!outcome.answer.text.is_empty());
}

#[tokio::test]
async fn scenario_c_no_datasets_skips_planning_and_execution() {
    let model = Arc::new(FakeModel::new());
    let executor = Arc::new(FakeExecutor::new(vec![]));

    let pipeline = pipeline_with(
        Arc::clone(&model),
        FakeSearch { datasets: vec![] },
        Arc::clone(&executor),
    );

    let (sink, mut rx) = EventSink::channel();
    let outcome = pipeline
        .run(
            QueryRequest {
                question: "figures from the warp-drive dataset?".to_string(),
                ..Default::default()
            },
            sink,
        )
        .await;

    // No SQL was ever planned or executed.
    assert_eq!(model.consulted("sql_plan"), 0);
    assert_eq!(executor.call_count(), 0);
    assert!(outcome.result.subqueries[0].sql_queries.is_empty());

    // The no-datasets explanation reaches the stream.
    let mut translator = EventTranslator::new();
    let adapter = NativeSseAdapter::new(None, None);
    let mut saw_explanation = false;
    while let Ok(event) = rx.try_recv() {
        for chunk in translator.translate(&event) {
            if let Some(frame) = adapter.frame(&chunk) {
                if frame.contains("No relevant datasets") {
                    saw_explanation = true;
                }
            }
        }
    }
    assert!(saw_explanation);
}

#[tokio::test]
async fn openai_stream_has_role_once_and_tool_carriers() {
    let mut model = FakeModel::new();
    model.selection = r#"{"datasets": [{"name": "Sales", "columns": []}], "reasoning": "sales"}"#.to_string();
    model.sql_plan = r#"{"strategy": "single_query", "queries": [{"sql": "select region from tbl_sales_v2", "explanation": "regions"}], "tables_used": ["tbl_sales_v2"], "reasoning": "one"}"#.to_string();
    model.answer = "Regions: North and South.".to_string();
    let model = Arc::new(model);
    let executor = Arc::new(FakeExecutor::new(vec![Ok(vec![revenue_row("North", 1.0)])]));

    let pipeline = pipeline_with(
        model,
        FakeSearch {
            datasets: vec![sales_dataset()],
        },
        executor,
    );

    let (sink, mut rx) = EventSink::channel();
    pipeline
        .run(
            QueryRequest {
                question: "which regions?".to_string(),
                ..Default::default()
            },
            sink,
        )
        .await;

    let mut translator = EventTranslator::new();
    let mut adapter = OpenAiStreamAdapter::new("test-model");
    let mut role_count = 0;
    let mut tool_indices = Vec::new();
    let mut content = String::new();
    while let Ok(event) = rx.try_recv() {
        for chunk in translator.translate(&event) {
            if let Some(delta_chunk) = adapter.on_chunk(&chunk) {
                let delta = &delta_chunk.choices[0].delta;
                if delta.role.is_some() {
                    role_count += 1;
                }
                if let Some(ref c) = delta.content {
                    content.push_str(c);
                }
                if let Some(ref calls) = delta.tool_calls {
                    tool_indices.extend(calls.iter().map(|c| c.index));
                }
            }
        }
    }
    let finish = adapter.finish();

    // The assistant role appears exactly once, on the first content delta.
    assert_eq!(role_count, 1);
    assert_eq!(content, "Regions: North and South.");
    // Progress narration rode along as monotonically indexed tool calls.
    assert!(!tool_indices.is_empty());
    assert!(tool_indices.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn conversational_question_skips_data_path_entirely() {
    let mut model = FakeModel::new();
    model.assessment = r#"{"needs_breakdown": false, "query_type": "conversational", "reasoning": "greeting", "confidence": 9}"#.to_string();
    model.answer = "Hello! Ask me about your datasets.".to_string();
    let model = Arc::new(model);
    let executor = Arc::new(FakeExecutor::new(vec![]));

    let pipeline = pipeline_with(
        Arc::clone(&model),
        FakeSearch { datasets: vec![] },
        Arc::clone(&executor),
    );

    let outcome = pipeline
        .run(
            QueryRequest {
                question: "hi there".to_string(),
                ..Default::default()
            },
            EventSink::disabled(),
        )
        .await;

    assert_eq!(model.consulted("selection"), 0);
    assert_eq!(model.consulted("conversational"), 1);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(outcome.answer.text, "Hello! Ask me about your datasets.");
    assert_eq!(
        outcome.result.subqueries[0].query_type,
        Some(QueryType::Conversational)
    );
}
