//! Process-local observability: the in-memory run log.

pub mod execution_log;
