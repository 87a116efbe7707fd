//! Execution Log Store
//!
//! In-memory record of completed runs, capped to the most recent N entries.
//! Process-local bookkeeping, not a metrics system.

use crate::query_result::QueryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub subquery_count: usize,
    pub sql_queries: Vec<String>,
    pub total_retries: u32,
    pub success: bool,
    pub elapsed_ms: u64,
}

impl RunLogEntry {
    pub fn from_result(run_id: &str, result: &QueryResult, success: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            question: result.question.clone(),
            subquery_count: result.subqueries.len(),
            sql_queries: result
                .subqueries
                .iter()
                .flat_map(|s| s.sql_queries.iter().map(|q| q.sql_query.clone()))
                .collect(),
            total_retries: result.subqueries.iter().map(|s| s.retry_count).sum(),
            success,
            elapsed_ms: result.elapsed_ms(),
        }
    }
}

pub struct ExecutionLogStore {
    entries: Mutex<Vec<RunLogEntry>>,
    max_entries: usize,
}

impl ExecutionLogStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    pub fn record(&self, entry: RunLogEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let overflow = entries.len() - self.max_entries;
            entries.drain(..overflow);
        }
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<RunLogEntry> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn export_json(&self) -> String {
        let entries = self.entries.lock().unwrap();
        serde_json::to_string_pretty(&*entries).unwrap_or_else(|_| "[]".to_string())
    }
}

impl Default for ExecutionLogStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> RunLogEntry {
        RunLogEntry {
            run_id: id.to_string(),
            timestamp: Utc::now(),
            question: "q".to_string(),
            subquery_count: 1,
            sql_queries: vec![],
            total_retries: 0,
            success: true,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_store_caps_entries() {
        let store = ExecutionLogStore::new(2);
        store.record(entry("a"));
        store.record(entry("b"));
        store.record(entry("c"));
        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "c");
        assert_eq!(recent[1].run_id, "b");
    }
}
