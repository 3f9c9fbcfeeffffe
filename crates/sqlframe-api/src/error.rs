use thiserror::Error;

/// Failure reported by a query execution collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The engine refused the statement (syntax, types, unknown identifiers).
    #[error("Engine rejected statement: {0}")]
    Rejected(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unsupported request: {0}")]
    Unsupported(String),
}
