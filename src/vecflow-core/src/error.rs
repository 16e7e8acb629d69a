//! Error taxonomy for vecflow operations.
//!
//! Configuration errors (schema, registration, binding) and collaborator
//! contract violations abort the whole operation. Per-row failures surface
//! as [`Error::Transform`] or [`Error::Timeout`] and leave the stage resumable.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A registered type conflicts with the physical table of the same name.
    #[error("schema conflict on `{table}`: {reason}")]
    SchemaConflict { table: String, reason: String },

    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),

    /// A transform parameter cannot be bound to a source field.
    #[error("stage `{stage}`: cannot bind parameter `{param}`: {reason}")]
    ParameterBinding {
        stage: String,
        param: String,
        reason: String,
    },

    #[error("stage `{0}` is already bound")]
    DuplicateStage(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("entity type `{table}` has no {kind} field")]
    UnsupportedSearch { table: String, kind: &'static str },

    #[error("dimension mismatch on `{table}.{field}`: expected {expected}, got {actual}")]
    DimensionMismatch {
        table: String,
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("reranker contract violation: {0}")]
    RerankContractViolation(String),

    #[error("evaluator contract violation: {0}")]
    EvaluationContractViolation(String),

    #[error("invalid value for `{table}.{field}`: {reason}")]
    InvalidValue {
        table: String,
        field: String,
        reason: String,
    },

    #[error("expected an entity of type `{expected}`, got `{actual}`")]
    EntityTypeMismatch { expected: String, actual: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pipeline contains a cycle through stage `{0}`")]
    PipelineCycle(String),

    /// The user transform failed for one unit of work.
    #[error("stage `{stage}` failed{}", source_row(.source_id))]
    Transform {
        stage: String,
        source_id: Option<i64>,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage `{stage}` timed out after {after:?}{}", source_row(.source_id))]
    Timeout {
        stage: String,
        source_id: Option<i64>,
        after: Duration,
    },

    /// A collaborator called outside a stage failed.
    #[error("{name} failed")]
    Collaborator {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn source_row(source_id: &Option<i64>) -> String {
    match source_id {
        Some(id) => format!(" on source row {id}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid_value(
        table: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            table: table.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn binding(
        stage: impl Into<String>,
        param: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ParameterBinding {
            stage: stage.into(),
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// True for per-row failures that a later invocation may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transform { .. } | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
