//! Error taxonomy for the decision engine.
//!
//! Collaborator failures stay opaque (`anyhow::Error`) and are tagged with the
//! stage that produced them. "Not enough data" is never an error here: case
//! memory returns [`crate::types::Retrieval::InsufficientData`] and the
//! outcome tracker returns [`crate::types::FeedbackStatus::Pending`].

use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Which external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Draft,
    Critique,
    Embed,
    MarketData,
    Summarize,
    Synthesize,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Draft => "draft",
            Stage::Critique => "critique",
            Stage::Embed => "embed",
            Stage::MarketData => "market-data",
            Stage::Summarize => "summarize",
            Stage::Synthesize => "synthesize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured collaborator reply that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {what}: {reason}")]
pub struct ParseError {
    pub what: &'static str,
    pub reason: String,
}

impl ParseError {
    pub fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{stage} collaborator failed: {source:#}")]
    Collaborator {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("vector index desynchronised: {vectors} vectors but {ids} ids")]
    IndexDesync { vectors: usize, ids: usize },
    #[error("corrupt vector index: {0}")]
    CorruptIndex(String),
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    pub fn collaborator(stage: Stage, source: anyhow::Error) -> Self {
        EngineError::Collaborator { stage, source }
    }

    /// Fatal errors need manual recovery; retrying the same call cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::IndexDesync { .. }
                | EngineError::CorruptIndex(_)
                | EngineError::DimensionMismatch { .. }
                | EngineError::Config(_)
        )
    }
}
