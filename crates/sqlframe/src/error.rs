use sqlframe_api::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The engine rejected a compiled expression. Nothing was committed.
    #[error("{message}\nError when evaluating '{expression}'")]
    Query { expression: String, message: String },

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("A column named '{0}' already exists")]
    DuplicateColumn(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(
        "The aggregate function '{0}' doesn't exist or is not managed by the 'analytic' method"
    )]
    UnknownAggregate(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FrameError {
    pub(crate) fn query(expression: impl Into<String>, source: &EngineError) -> Self {
        FrameError::Query {
            expression: expression.into(),
            message: source.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
