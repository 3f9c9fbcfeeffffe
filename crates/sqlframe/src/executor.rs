use async_trait::async_trait;
use sqlframe_api::{EngineError, FetchMode, QueryResult};

/// The query execution collaborator.
///
/// Sends SQL text to the engine and returns rows or the engine's error.
/// `purpose` is a short label describing why the statement is issued and is
/// only used for logging.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        purpose: &str,
        fetch: FetchMode,
    ) -> std::result::Result<QueryResult, EngineError>;
}
