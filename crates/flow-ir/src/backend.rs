//! Abstract table backend the compiled operations run against
//!
//! A backend owns the relation values. Every method receives the handle the
//! compiler allocated for its result, so the backend never invents names.

use thiserror::Error;

use crate::{Aggregation, DerivedColumn, Expr, RelationHandle, ResolvedSource, SinkSpec};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unknown relation: {0}")]
    UnknownRelation(RelationHandle),

    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },

    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn failed(operation: &'static str, message: impl ToString) -> Self {
        BackendError::Failed {
            operation,
            message: message.to_string(),
        }
    }
}

pub trait TableBackend {
    fn load(&mut self, source: &ResolvedSource, output: RelationHandle) -> Result<(), BackendError>;

    fn filter(
        &mut self,
        input: RelationHandle,
        predicate: &Expr,
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    fn select(
        &mut self,
        input: RelationHandle,
        columns: &[String],
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    fn sort(
        &mut self,
        input: RelationHandle,
        by: &[String],
        ascending: bool,
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    /// All expressions see the input columns only (simultaneous assignment)
    fn derive(
        &mut self,
        input: RelationHandle,
        columns: &[DerivedColumn],
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    /// Produce a grouped, not yet aggregated relation
    fn group(
        &mut self,
        input: RelationHandle,
        by: &[String],
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    fn group_aggregate(
        &mut self,
        input: RelationHandle,
        group_by: &[String],
        aggregations: &[Aggregation],
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    /// Inner equi-join. Right columns replace left columns of the same name.
    fn join(
        &mut self,
        left: RelationHandle,
        right: RelationHandle,
        left_on: &str,
        right_on: &str,
        output: RelationHandle,
    ) -> Result<(), BackendError>;

    fn persist(&mut self, input: RelationHandle, sink: &SinkSpec) -> Result<(), BackendError>;

    /// True iff `predicate` holds for every row of `input`
    fn check(&mut self, input: RelationHandle, predicate: &Expr) -> Result<bool, BackendError>;
}
