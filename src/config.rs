//! Run Configuration
//!
//! Thresholds and model handles for a query run. Every numeric limit here is a
//! tunable, not a contract: defaults can be overridden through `DATAPILOT_*`
//! environment variables.

use serde::{Deserialize, Serialize};

/// Constraint set handed to the SQL generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConstraints {
    /// Permit LIKE/ILIKE style operators in generated SQL.
    pub allow_pattern_matching: bool,
    /// Wrap both sides of value comparisons in lower().
    pub case_insensitive_comparison: bool,
}

impl Default for SqlConstraints {
    fn default() -> Self {
        Self {
            allow_pattern_matching: false,
            case_insensitive_comparison: true,
        }
    }
}

/// Configuration for one query run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Upper bound on sub-questions produced by the breakdown step.
    pub max_subqueries: usize,
    /// Replan/reidentify budget per sub-query. Once reached, the router is
    /// forced to validate whatever was obtained.
    pub max_retries: u32,
    /// Row-count threshold for the oversized-result classification.
    pub max_result_rows: usize,
    /// Serialized-size threshold in bytes (roughly 25k tokens).
    pub max_result_bytes: usize,
    /// Column-count threshold, checked against the first record.
    pub max_result_columns: usize,
    /// Candidate datasets requested from the similarity search.
    pub search_top_k: usize,
    /// Rows fed into the statistical summary.
    pub summary_sample_rows: usize,
    /// Literal rows carried verbatim inside a summary.
    pub summary_literal_rows: usize,
    /// Top-N categorical values reported per column.
    pub summary_top_values: usize,
    /// Embedding model handle passed through to the similarity search.
    pub embedding_model: String,
    /// Default chat model when the request does not name one.
    pub default_model: String,
    pub sql_constraints: SqlConstraints,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_subqueries: 3,
            max_retries: 2,
            max_result_rows: 200,
            max_result_bytes: 100_000,
            max_result_columns: 50,
            search_top_k: 5,
            summary_sample_rows: 100,
            summary_literal_rows: 5,
            summary_top_values: 5,
            embedding_model: "text-embedding-3-small".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            sql_constraints: SqlConstraints::default(),
        }
    }
}

impl RunConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_subqueries: env_usize("DATAPILOT_MAX_SUBQUERIES", d.max_subqueries),
            max_retries: env_u32("DATAPILOT_MAX_RETRIES", d.max_retries),
            max_result_rows: env_usize("DATAPILOT_MAX_RESULT_ROWS", d.max_result_rows),
            max_result_bytes: env_usize("DATAPILOT_MAX_RESULT_BYTES", d.max_result_bytes),
            max_result_columns: env_usize("DATAPILOT_MAX_RESULT_COLUMNS", d.max_result_columns),
            search_top_k: env_usize("DATAPILOT_SEARCH_TOP_K", d.search_top_k),
            summary_sample_rows: env_usize("DATAPILOT_SUMMARY_SAMPLE_ROWS", d.summary_sample_rows),
            summary_literal_rows: env_usize("DATAPILOT_SUMMARY_LITERAL_ROWS", d.summary_literal_rows),
            summary_top_values: env_usize("DATAPILOT_SUMMARY_TOP_VALUES", d.summary_top_values),
            embedding_model: std::env::var("DATAPILOT_EMBEDDING_MODEL")
                .unwrap_or(d.embedding_model),
            default_model: std::env::var("DATAPILOT_DEFAULT_MODEL").unwrap_or(d.default_model),
            sql_constraints: SqlConstraints::default(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
