//! Interpret an operation list against a [`TableBackend`]

use std::collections::HashMap;

use flow_ir::{BackendError, NoColumns, Operation, TableBackend};
use serde::Serialize;
use tracing::debug;

use crate::error::RuntimeError;

/// Source of secret values referenced by `env("NAME")`
pub trait SecretResolver {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretResolver for EnvSecrets {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretResolver for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub operations: usize,
    pub assertions: usize,
    pub persisted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Executor<S = EnvSecrets> {
    secrets: S,
}

impl Executor<EnvSecrets> {
    pub fn from_env() -> Self {
        Self { secrets: EnvSecrets }
    }
}

impl<S: SecretResolver> Executor<S> {
    pub fn new(secrets: S) -> Self {
        Self { secrets }
    }

    /// Run operations in order, stopping at the first failure
    pub fn execute(
        &self,
        operations: &[Operation],
        backend: &mut dyn TableBackend,
    ) -> Result<ExecutionReport, RuntimeError> {
        let mut report = ExecutionReport::default();
        for op in operations {
            debug!(op = op.kind(), inputs = ?op.inputs(), output = ?op.output(), "Executing operation");
            self.execute_one(op, backend)?;
            report.operations += 1;
            match op {
                Operation::Assert { .. } => report.assertions += 1,
                Operation::Persist { .. } => report.persisted += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    fn execute_one(&self, op: &Operation, backend: &mut dyn TableBackend) -> Result<(), RuntimeError> {
        let failure = |source: BackendError| RuntimeError::BackendFailure {
            operation: op.kind(),
            source,
        };

        match op {
            Operation::Load { source, output } => {
                let resolved = source.resolve(|name| self.secrets.lookup(name))?;
                backend.load(&resolved, *output).map_err(failure)
            }
            Operation::Filter { input, predicate, output } => {
                backend.filter(*input, predicate, *output).map_err(failure)
            }
            Operation::Select { input, columns, output } => {
                backend.select(*input, columns, *output).map_err(failure)
            }
            Operation::Sort {
                input,
                by,
                ascending,
                output,
            } => backend.sort(*input, by, *ascending, *output).map_err(failure),
            Operation::Derive { input, columns, output } => {
                backend.derive(*input, columns, *output).map_err(failure)
            }
            Operation::Group { input, by, output } => backend.group(*input, by, *output).map_err(failure),
            Operation::GroupAggregate {
                input,
                group_by,
                aggregations,
                output,
            } => backend
                .group_aggregate(*input, group_by, aggregations, *output)
                .map_err(failure),
            Operation::Join {
                left,
                right,
                left_on,
                right_on,
                output,
            } => backend
                .join(*left, *right, left_on, right_on, *output)
                .map_err(failure),
            Operation::Persist { input, sink } => backend.persist(*input, sink).map_err(failure),
            Operation::Assert { input, predicate, text } => {
                let holds = match input {
                    Some(input) => backend.check(*input, predicate).map_err(failure)?,
                    None => predicate
                        .eval(&NoColumns)
                        .map_err(|source| RuntimeError::AssertionEvaluation {
                            assertion: text.clone(),
                            source,
                        })?
                        .is_true(),
                };
                if holds {
                    Ok(())
                } else {
                    Err(RuntimeError::AssertionFailed {
                        assertion: text.clone(),
                    })
                }
            }
        }
    }
}
