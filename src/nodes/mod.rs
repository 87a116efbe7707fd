//! Decision Nodes
//!
//! The fixed, small node topology of a query run. Each node is one LLM-driven
//! decision (or the execution step) that reads and appends to the shared
//! `QueryResult`.

pub mod dataset_selector;
pub mod execution;
pub mod replan;
pub mod sql_planner;
pub mod subquery_planner;
pub mod synthesizer;

/// Node names used for event tagging and cross-node message context.
pub const SUBQUERY_PLANNER: &str = "subquery_planner";
pub const DATASET_SELECTOR: &str = "dataset_selector";
pub const SQL_PLANNER: &str = "sql_planner";
pub const SQL_EXECUTOR: &str = "sql_executor";
pub const REPLAN_ROUTER: &str = "replan_router";
pub const RESPONSE_SYNTHESIZER: &str = "response_synthesizer";
