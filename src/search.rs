//! Dataset Similarity Search
//!
//! Collaborator interface for vector-similarity dataset discovery. The search
//! service owns the index; this side only sends a query plus optional scope and
//! receives pre-filtered candidate schemas.

use crate::error::{PilotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Statistics attached to a column by the ingestion pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    #[serde(default)]
    pub distinct_count: Option<u64>,
    #[serde(default)]
    pub null_count: Option<u64>,
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<serde_json::Value>,
}

/// One column of a queryable dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub sample_values: Vec<serde_json::Value>,
    #[serde(default)]
    pub stats: Option<ColumnStats>,
}

impl ColumnSchema {
    /// Case-insensitive membership test against the sample values.
    pub fn sample_contains(&self, literal: &str) -> bool {
        let needle = literal.to_lowercase();
        self.sample_values.iter().any(|v| {
            let shown = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            shown.to_lowercase() == needle
        })
    }
}

/// Schema of one queryable dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSchema {
    /// Display name shown to users and to the selector LLM.
    pub name: String,
    /// Real table name used in generated SQL.
    pub dataset_name: String,
    #[serde(default)]
    pub dataset_description: String,
    pub columns: Vec<ColumnSchema>,
}

impl DatasetSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// External similarity-search collaborator.
#[async_trait]
pub trait DatasetSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        embedding_model: &str,
        project_ids: Option<&[String]>,
        dataset_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<DatasetSchema>>;
}

/// HTTP client for the search service.
pub struct HttpDatasetSearch {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDatasetSearch {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    datasets: Vec<DatasetSchema>,
}

#[async_trait]
impl DatasetSearch for HttpDatasetSearch {
    async fn search(
        &self,
        query: &str,
        embedding_model: &str,
        project_ids: Option<&[String]>,
        dataset_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<DatasetSchema>> {
        let body = serde_json::json!({
            "query": query,
            "embedding_model": embedding_model,
            "project_ids": project_ids,
            "dataset_ids": dataset_ids,
            "top_k": top_k,
        });

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PilotError::Search(format!("Search service call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PilotError::Search(format!(
                "Search service error ({}): {}",
                status, text
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| PilotError::Search(format!("Failed to parse search response: {}", e)))?;

        Ok(parsed.datasets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_contains_is_case_insensitive() {
        let column = ColumnSchema {
            name: "region".to_string(),
            data_type: "varchar".to_string(),
            sample_values: vec![serde_json::json!("North"), serde_json::json!(42)],
            stats: None,
        };
        assert!(column.sample_contains("north"));
        assert!(column.sample_contains("42"));
        assert!(!column.sample_contains("west"));
    }
}
