//! Prompt Builders
//!
//! Templated prompt text for every LLM-driven node. All prompts demand JSON
//! output; the callers strip markdown fences and parse into typed structs.

use crate::config::SqlConstraints;
use crate::search::DatasetSchema;

/// Render conversation history for inclusion in a prompt. Empty history
/// renders as an explicit marker so the model does not invent prior turns.
pub fn render_history(history: &[(String, String)]) -> String {
    if history.is_empty() {
        return "(no prior conversation)".to_string();
    }
    history
        .iter()
        .map(|(role, content)| format!("{}: {}", role, content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render candidate dataset schemas with columns, sample values and stats.
pub fn render_schemas(datasets: &[DatasetSchema]) -> String {
    let mut parts = Vec::new();
    for dataset in datasets {
        parts.push(format!(
            "Dataset: {} (table: {})\nDescription: {}",
            dataset.name, dataset.dataset_name, dataset.dataset_description
        ));
        for column in &dataset.columns {
            let samples: Vec<String> = column
                .sample_values
                .iter()
                .take(5)
                .map(|v| v.to_string())
                .collect();
            let stats = column
                .stats
                .as_ref()
                .and_then(|s| s.distinct_count.map(|d| format!(", distinct={}", d)))
                .unwrap_or_default();
            parts.push(format!(
                "  - {} ({}) samples=[{}]{}",
                column.name,
                column.data_type,
                samples.join(", "),
                stats
            ));
        }
    }
    parts.join("\n")
}

pub fn breakdown_assessment(question: &str, history: &[(String, String)]) -> String {
    format!(
        r#"You decide whether a user question must be split into independent sub-questions before data analysis.

Default to NO breakdown. Split only when the question contains genuinely independent asks that cannot be answered by one analysis. Also classify the question: "data_query" if it asks about data, "conversational" if it is chit-chat or a question about the assistant, "tool_only" if it only asks to run a tool.

Conversation so far:
{}

Question: "{}"

Return JSON only:
{{"needs_breakdown": true|false, "query_type": "data_query"|"conversational"|"tool_only", "reasoning": "one sentence", "confidence": 0-10}}"#,
        render_history(history),
        question
    )
}

pub fn breakdown(question: &str, history: &[(String, String)]) -> String {
    format!(
        r#"Split the user question into 2-3 independent sub-questions.

Rules:
- Each sub-question must be natural language a data analyst could answer on its own.
- Never write SQL.
- Never write procedural steps ("first do X then Y") - only independent questions.

Conversation so far:
{}

Question: "{}"

Return JSON only:
{{"sub_questions": ["...", "..."]}}"#,
        render_history(history),
        question
    )
}

pub fn dataset_selection(question: &str, candidates: &[DatasetSchema]) -> String {
    format!(
        r#"Pick the datasets needed to answer the question, and for each one list the required columns with value hints.

Value hint rules (critical):
- "exact_values": ONLY literals you can see verbatim in that column's sample values. Never guess an exact value.
- "fuzzy_values": terms from the question that likely map to column values but are not visible in the samples.

Candidate datasets:
{}

Question: "{}"

Return JSON only:
{{"datasets": [{{"name": "dataset display name", "columns": [{{"name": "column", "exact_values": [], "fuzzy_values": []}}]}}], "reasoning": "one sentence"}}

Select the minimal set. If none of the candidates can answer the question, return {{"datasets": [], "reasoning": "..."}}."#,
        render_schemas(candidates),
        question
    )
}

pub fn sql_planning(
    question: &str,
    datasets: &[DatasetSchema],
    selection_hints: &str,
    error_context: &str,
    constraints: &SqlConstraints,
) -> String {
    let comparison_rule = if constraints.case_insensitive_comparison {
        "- Compare values case-insensitively: wrap BOTH sides in lower()."
    } else {
        "- Compare values as-is."
    };
    let pattern_rule = if constraints.allow_pattern_matching {
        "- Pattern-match operators (LIKE) are allowed when needed."
    } else {
        "- Never use pattern-match operators (LIKE, ILIKE, SIMILAR TO)."
    };
    let error_section = if error_context.is_empty() {
        String::new()
    } else {
        format!(
            "\nPrevious attempts failed. Fix the cause before regenerating:\n{}\n",
            error_context
        )
    };

    format!(
        r#"Write SQL to answer the question from the selected datasets.

First decide the strategy: if the datasets share a joinable relationship, write ONE query with the appropriate joins ("single_query"). If they are unrelated, write one independent query per dataset ("multiple_queries").

Rules:
- Only read queries (SELECT). Never modify data.
{}
{}
- Always use the real table name (shown as "table:"), never the display name.
- Every query needs a one-sentence explanation.

Selected datasets:
{}

Column hints from dataset selection:
{}
{}
Question: "{}"

Return JSON only:
{{"strategy": "single_query"|"multiple_queries", "queries": [{{"sql": "...", "explanation": "..."}}], "tables_used": ["..."], "reasoning": "one sentence"}}"#,
        comparison_rule,
        pattern_rule,
        render_schemas(datasets),
        selection_hints,
        error_section,
        question
    )
}

pub fn replan_classification(error: &str, error_history: &str, node_context: &str) -> String {
    format!(
        r#"A SQL query failed. Classify the failure into exactly one remediation path.

- "reidentify_datasets": the dataset or schema assumption was wrong (wrong table, column does not exist in any selected dataset, the data needed lives elsewhere).
- "replan": the datasets are right but the query must be reformulated (syntax error, bad join, wrong aggregation, type mismatch on a known column).
- "validate_query_result": retrying will not help; proceed with whatever was obtained. This is NOT a success signal, only "stop retrying".

Do not claim success that the data does not show. When unsure between retry paths, prefer the one that re-examines assumptions.

Error:
{}

Error history for this sub-question:
{}

Context from earlier steps:
{}

Return JSON only:
{{"decision": "reidentify_datasets"|"replan"|"validate_query_result", "reasoning": "one sentence"}}"#,
        error, error_history, node_context
    )
}

pub fn data_answer(question: &str, evidence: &str, history: &[(String, String)]) -> String {
    format!(
        r#"Answer the user's question from the evidence below.

Hard rules:
- Use ONLY values present in the evidence. Never fabricate a number, name or date.
- If the evidence only partially answers the question, say which part is answered.
- Plain language, no SQL jargon, no apologies for formatting.

Conversation so far:
{}

Question: "{}"

Evidence:
{}"#,
        render_history(history),
        question,
        evidence
    )
}

pub fn empty_results(question: &str, context: &str) -> String {
    format!(
        r#"The analysis ran but returned no rows for the user's question. Write a short, friendly answer that:
- states that no matching data was found,
- suggests 2-3 concrete rephrasings or filter changes that might match the data,
- never exposes SQL, error text or internal details.

Question: "{}"

What was attempted:
{}"#,
        question, context
    )
}

pub fn conversational(question: &str, history: &[(String, String)]) -> String {
    format!(
        r#"You are a data analysis assistant. The user's message needs no data query. Reply briefly and helpfully. If they ask what you can do, explain that you answer questions over their tabular datasets.

Conversation so far:
{}

Message: "{}""#,
        render_history(history),
        question
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_history_empty_marker() {
        assert_eq!(render_history(&[]), "(no prior conversation)");
        let history = vec![("user".to_string(), "hi".to_string())];
        assert_eq!(render_history(&history), "user: hi");
    }

    #[test]
    fn test_sql_planning_mentions_constraints() {
        let constraints = SqlConstraints::default();
        let prompt = sql_planning("q", &[], "", "", &constraints);
        assert!(prompt.contains("lower()"));
        assert!(prompt.contains("Never use pattern-match"));
    }
}
