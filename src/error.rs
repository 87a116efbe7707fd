use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PilotError>;
