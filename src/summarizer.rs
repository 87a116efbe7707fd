//! Result Summarizer
//!
//! Oversize classification and the statistical reduction that replaces raw
//! rows before any further LLM call sees them. A result is oversized when any
//! of the configured row/byte/column thresholds is exceeded; the summary keeps
//! row/column counts, numeric min/max/avg/median over a capped sample,
//! categorical top-N value counts, and a small literal sample of rows.

use crate::config::RunConfig;
use crate::query_result::Row;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-column numeric statistics over the sampled rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
}

/// One categorical value with its frequency among sampled non-null values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryCount {
    pub value: String,
    pub count: usize,
    pub percentage: f64,
}

/// Bounded stand-in for an oversized result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: usize,
    pub column_count: usize,
    pub numeric_columns: HashMap<String, NumericSummary>,
    pub categorical_columns: HashMap<String, Vec<CategoryCount>>,
    pub sample_rows: Vec<Row>,
}

/// Classify a result set against the configured size thresholds.
pub fn is_oversized(rows: &[Row], config: &RunConfig) -> bool {
    if rows.len() > config.max_result_rows {
        return true;
    }
    if let Some(first) = rows.first() {
        if first.len() > config.max_result_columns {
            return true;
        }
    }
    let serialized_len = serde_json::to_string(rows).map(|s| s.len()).unwrap_or(0);
    serialized_len > config.max_result_bytes
}

/// Reduce a result set to a bounded summary.
pub fn summarize(rows: &[Row], config: &RunConfig) -> ResultSummary {
    let sample: Vec<&Row> = rows.iter().take(config.summary_sample_rows).collect();
    let columns: Vec<String> = rows
        .first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default();

    let mut numeric_columns = HashMap::new();
    let mut categorical_columns = HashMap::new();

    for column in &columns {
        let values: Vec<&serde_json::Value> = sample
            .iter()
            .filter_map(|r| r.get(column))
            .filter(|v| !v.is_null())
            .collect();
        if values.is_empty() {
            continue;
        }

        let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
        if numbers.len() == values.len() {
            numeric_columns.insert(column.clone(), numeric_summary(&numbers));
        } else {
            let total = values.len();
            let top = values
                .iter()
                .map(|v| display_value(v))
                .counts()
                .into_iter()
                .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
                .take(config.summary_top_values)
                .map(|(value, count)| CategoryCount {
                    value,
                    count,
                    percentage: (count as f64 / total as f64) * 100.0,
                })
                .collect();
            categorical_columns.insert(column.clone(), top);
        }
    }

    ResultSummary {
        row_count: rows.len(),
        column_count: columns.len(),
        numeric_columns,
        categorical_columns,
        sample_rows: rows
            .iter()
            .take(config.summary_literal_rows)
            .cloned()
            .collect(),
    }
}

fn numeric_summary(numbers: &[f64]) -> NumericSummary {
    let mut sorted = numbers.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    NumericSummary {
        min: sorted[0],
        max: sorted[n - 1],
        avg: sorted.iter().sum::<f64>() / n as f64,
        median,
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
