//! Dataset Selector
//!
//! Maps a sub-question to the datasets and candidate column values needed to
//! answer it. Candidates come from the external similarity search; an LLM then
//! picks the subset and lists required columns with value hints. Exact-value
//! hints are enforced against sample data after the LLM answers: a literal the
//! samples do not show is demoted to a fuzzy hint, never kept as exact.

use crate::config::RunConfig;
use crate::error::Result;
use crate::llm::{clean_json_response, ChatMessage, ChatModel};
use crate::prompts;
use crate::search::{DatasetSchema, DatasetSearch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Required column with value hints for the SQL planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRequirement {
    pub name: String,
    /// Literals visible verbatim in the column's sample data. Safe to assert
    /// equality on.
    #[serde(default)]
    pub exact_values: Vec<String>,
    /// Question terms that likely map to column values but were not seen in
    /// the samples.
    #[serde(default)]
    pub fuzzy_values: Vec<String>,
}

/// One dataset the selector decided is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedDataset {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnRequirement>,
}

#[derive(Debug, Clone, Deserialize)]
struct SelectorOutput {
    #[serde(default)]
    datasets: Vec<SelectedDataset>,
    #[serde(default)]
    reasoning: String,
}

/// Selection result handed to the SQL planner.
#[derive(Debug, Clone)]
pub struct DatasetSelection {
    pub datasets: Vec<SelectedDataset>,
    /// Full schemas of the selected datasets, in selection order.
    pub schemas: Vec<DatasetSchema>,
    /// Display name -> real table name.
    pub table_map: HashMap<String, String>,
    pub reasoning: String,
}

impl DatasetSelection {
    /// Render the column hints for the SQL planning prompt.
    pub fn render_hints(&self) -> String {
        let mut parts = Vec::new();
        for dataset in &self.datasets {
            for column in &dataset.columns {
                let mut hint = format!("{}.{}", dataset.name, column.name);
                if !column.exact_values.is_empty() {
                    hint.push_str(&format!(" exact={:?}", column.exact_values));
                }
                if !column.fuzzy_values.is_empty() {
                    hint.push_str(&format!(" fuzzy={:?}", column.fuzzy_values));
                }
                parts.push(hint);
            }
        }
        if parts.is_empty() {
            "(no column hints)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Outcome of dataset selection for one sub-question. Finding nothing is a
/// routing decision, not an error.
#[derive(Debug, Clone)]
pub enum SelectorOutcome {
    Selected(DatasetSelection),
    /// No usable candidates; the sub-query goes straight to synthesis.
    NoDatasets { message: String },
}

pub struct DatasetSelector {
    llm: Arc<dyn ChatModel>,
    search: Arc<dyn DatasetSearch>,
}

impl DatasetSelector {
    pub fn new(llm: Arc<dyn ChatModel>, search: Arc<dyn DatasetSearch>) -> Self {
        Self { llm, search }
    }

    pub async fn select(
        &self,
        question: &str,
        project_ids: Option<&[String]>,
        dataset_ids: Option<&[String]>,
        config: &RunConfig,
    ) -> Result<SelectorOutcome> {
        let candidates = self
            .search
            .search(
                question,
                &config.embedding_model,
                project_ids,
                dataset_ids,
                config.search_top_k,
            )
            .await?;

        if candidates.is_empty() {
            info!("Similarity search returned no candidates");
            return Ok(SelectorOutcome::NoDatasets {
                message: "No relevant datasets were found for this question.".to_string(),
            });
        }

        let prompt = prompts::dataset_selection(question, &candidates);
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
        let output: SelectorOutput = serde_json::from_str(clean_json_response(&response.content))?;

        let selection = validate_selection(output, &candidates);
        if selection.datasets.is_empty() {
            return Ok(SelectorOutcome::NoDatasets {
                message: "None of the available datasets can answer this question.".to_string(),
            });
        }

        info!(
            "Selected {} dataset(s): {:?}",
            selection.datasets.len(),
            selection.table_map.keys().collect::<Vec<_>>()
        );
        Ok(SelectorOutcome::Selected(selection))
    }
}

/// Validate the LLM's selection against the candidate universe: drop unknown
/// dataset names and enforce the exact-value contract per column.
fn validate_selection(output: SelectorOutput, candidates: &[DatasetSchema]) -> DatasetSelection {
    let mut datasets = Vec::new();
    let mut schemas = Vec::new();
    let mut table_map = HashMap::new();

    for mut selected in output.datasets {
        let Some(schema) = candidates.iter().find(|c| c.name == selected.name) else {
            warn!("Selector chose unknown dataset '{}', dropping", selected.name);
            continue;
        };

        selected.columns.retain(|c| {
            let known = schema.column(&c.name).is_some();
            if !known {
                warn!(
                    "Selector chose unknown column '{}.{}', dropping",
                    selected.name, c.name
                );
            }
            known
        });

        for column in &mut selected.columns {
            enforce_exact_values(column, schema);
            rank_fuzzy_values(column, schema);
        }

        table_map.insert(schema.name.clone(), schema.dataset_name.clone());
        schemas.push(schema.clone());
        datasets.push(selected);
    }

    DatasetSelection {
        datasets,
        schemas,
        table_map,
        reasoning: output.reasoning,
    }
}

/// Demote exact values absent from the column's sample data to fuzzy hints.
fn enforce_exact_values(column: &mut ColumnRequirement, schema: &DatasetSchema) {
    let Some(column_schema) = schema.column(&column.name) else {
        return;
    };
    let (kept, demoted): (Vec<String>, Vec<String>) = column
        .exact_values
        .drain(..)
        .partition(|v| column_schema.sample_contains(v));
    if !demoted.is_empty() {
        warn!(
            "Demoting exact values {:?} on '{}' - not present in sample data",
            demoted, column.name
        );
    }
    column.exact_values = kept;
    for value in demoted {
        if !column.fuzzy_values.contains(&value) {
            column.fuzzy_values.push(value);
        }
    }
}

/// Order fuzzy hints by best similarity to any sample value, most similar
/// first, so the SQL planner sees the strongest hints up front.
fn rank_fuzzy_values(column: &mut ColumnRequirement, schema: &DatasetSchema) {
    let Some(column_schema) = schema.column(&column.name) else {
        return;
    };
    let samples: Vec<String> = column_schema
        .sample_values
        .iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        })
        .collect();

    let score = |value: &String| -> f64 {
        let needle = value.to_lowercase();
        samples
            .iter()
            .map(|s| strsim::normalized_levenshtein(&needle, s))
            .fold(0.0_f64, f64::max)
    };

    column
        .fuzzy_values
        .sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ColumnSchema;

    fn candidate() -> DatasetSchema {
        DatasetSchema {
            name: "Sales".to_string(),
            dataset_name: "tbl_sales_v2".to_string(),
            dataset_description: "Sales facts".to_string(),
            columns: vec![ColumnSchema {
                name: "region".to_string(),
                data_type: "varchar".to_string(),
                sample_values: vec![serde_json::json!("North"), serde_json::json!("South")],
                stats: None,
            }],
        }
    }

    #[test]
    fn test_exact_values_absent_from_samples_are_demoted() {
        let output = SelectorOutput {
            datasets: vec![SelectedDataset {
                name: "Sales".to_string(),
                columns: vec![ColumnRequirement {
                    name: "region".to_string(),
                    exact_values: vec!["North".to_string(), "Westland".to_string()],
                    fuzzy_values: vec![],
                }],
            }],
            reasoning: String::new(),
        };
        let selection = validate_selection(output, &[candidate()]);
        let column = &selection.datasets[0].columns[0];
        assert_eq!(column.exact_values, vec!["North"]);
        assert_eq!(column.fuzzy_values, vec!["Westland"]);
    }

    #[test]
    fn test_unknown_dataset_and_column_are_dropped() {
        let output = SelectorOutput {
            datasets: vec![
                SelectedDataset {
                    name: "Imaginary".to_string(),
                    columns: vec![],
                },
                SelectedDataset {
                    name: "Sales".to_string(),
                    columns: vec![ColumnRequirement {
                        name: "no_such_column".to_string(),
                        exact_values: vec![],
                        fuzzy_values: vec![],
                    }],
                },
            ],
            reasoning: String::new(),
        };
        let selection = validate_selection(output, &[candidate()]);
        assert_eq!(selection.datasets.len(), 1);
        assert!(selection.datasets[0].columns.is_empty());
        assert_eq!(selection.table_map["Sales"], "tbl_sales_v2");
    }

    #[test]
    fn test_fuzzy_values_ranked_by_similarity() {
        let output = SelectorOutput {
            datasets: vec![SelectedDataset {
                name: "Sales".to_string(),
                columns: vec![ColumnRequirement {
                    name: "region".to_string(),
                    exact_values: vec![],
                    fuzzy_values: vec!["zzzzzz".to_string(), "nort".to_string()],
                }],
            }],
            reasoning: String::new(),
        };
        let selection = validate_selection(output, &[candidate()]);
        let column = &selection.datasets[0].columns[0];
        assert_eq!(column.fuzzy_values[0], "nort");
    }
}
