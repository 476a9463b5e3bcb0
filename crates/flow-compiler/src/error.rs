//! Error taxonomy for compilation and execution

use std::fmt;

use flow_ast::ParseError;
use flow_ir::{BackendError, EvalError, MissingSecret};
use flow_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    UnknownColumn,
    UnknownSchema,
    UndefinedVariable,
    UnknownTableAlias,
    InvalidAggregateOrdering,
    InvalidJoinCondition,
    DuplicateSchema,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationKind::UnknownColumn => "UnknownColumn",
            ValidationKind::UnknownSchema => "UnknownSchema",
            ValidationKind::UndefinedVariable => "UndefinedVariable",
            ValidationKind::UnknownTableAlias => "UnknownTableAlias",
            ValidationKind::InvalidAggregateOrdering => "InvalidAggregateOrdering",
            ValidationKind::InvalidJoinCondition => "InvalidJoinCondition",
            ValidationKind::DuplicateSchema => "DuplicateSchema",
        };
        f.write_str(name)
    }
}

/// First violation found by the validator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub detail: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn unknown_column(column: &str, schema: &str, step: &str) -> Self {
        Self::new(
            ValidationKind::UnknownColumn,
            format!("column '{}' not found in schema '{}' ({})", column, schema, step),
        )
    }

    pub fn undefined_variable(name: &str) -> Self {
        Self::new(
            ValidationKind::UndefinedVariable,
            format!("variable '{}' is not defined", name),
        )
    }
}

impl From<RegistryError> for ValidationError {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::DuplicateSchema(_) => ValidationKind::DuplicateSchema,
            _ => ValidationKind::UnknownSchema,
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("aggregate in pipeline starting at '{pipeline}' must directly follow group_by")]
    AggregateWithoutGroupBy { pipeline: String },

    #[error("Unknown sink: {0}")]
    UnknownSink(String),

    #[error("Unknown source kind: {0}")]
    UnknownSourceKind(String),

    #[error("Unknown sink kind: {0}")]
    UnknownSinkKind(String),

    #[error("{kind} requires argument '{argument}'")]
    MissingArgument { kind: String, argument: String },

    #[error("{kind} argument '{argument}' cannot be read from the environment")]
    InvalidArgument { kind: String, argument: String },

    #[error("aggregate '{name}': {source}")]
    Aggregate {
        name: String,
        #[source]
        source: RegistryError,
    },

    #[error("Unsupported assertion '{0}': columns must come from exactly one variable")]
    UnsupportedAssertion(String),

    #[error(transparent)]
    Unresolved(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Missing secret: {0}")]
    MissingSecret(#[from] MissingSecret),

    #[error("Backend failure in {operation}: {source}")]
    BackendFailure {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("Assertion failed: {assertion}")]
    AssertionFailed { assertion: String },

    #[error("Cannot evaluate assertion '{assertion}': {source}")]
    AssertionEvaluation {
        assertion: String,
        #[source]
        source: EvalError,
    },
}

/// Anything that can go wrong between source text and executed operations
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl FlowError {
    /// Validation kind, including one surfaced by the code generator
    pub fn validation_kind(&self) -> Option<ValidationKind> {
        match self {
            FlowError::Validation(err) | FlowError::Compile(CompileError::Unresolved(err)) => Some(err.kind),
            _ => None,
        }
    }

    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, FlowError::Runtime(RuntimeError::AssertionFailed { .. }))
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
