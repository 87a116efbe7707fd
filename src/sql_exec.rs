//! SQL Execution Service
//!
//! Collaborator interface for running SQL. The execution service is a black
//! box: it either returns rows (possibly none) or an error with a message and
//! an optional code. No further error taxonomy is assumed here.

use crate::error::{PilotError, Result};
use crate::query_result::Row;
use async_trait::async_trait;
use serde::Deserialize;

/// External SQL execution collaborator.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;
}

/// HTTP client for the execution service.
pub struct HttpSqlExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSqlExecutor {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    rows: Option<Vec<Row>>,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[async_trait]
impl SqlExecutor for HttpSqlExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .json(&serde_json::json!({ "sql": sql }))
            .send()
            .await
            .map_err(|e| PilotError::Execution(format!("Execution service call failed: {}", e)))?;

        let status = response.status();
        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| PilotError::Execution(format!("Failed to parse execution response: {}", e)))?;

        if let Some(error) = parsed.error {
            let code = error.code.map(|c| format!(" (code {})", c)).unwrap_or_default();
            return Err(PilotError::Execution(format!("{}{}", error.message, code)));
        }

        if !status.is_success() {
            return Err(PilotError::Execution(format!(
                "Execution service error ({})",
                status
            )));
        }

        Ok(parsed.rows.unwrap_or_default())
    }
}
