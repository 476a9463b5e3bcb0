//! Run `test "name" { ... }` blocks in isolation
//!
//! Every block is validated, compiled and executed with fresh state and a
//! fresh backend, so blocks can run in any order or in parallel.

use flow_ast::{Program, TestBlock};
use flow_ir::{BackendError, TableBackend};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{FlowError, RuntimeError};
use crate::exec::{EnvSecrets, Executor, SecretResolver};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail")]
pub enum TestOutcome {
    Passed,
    /// An assertion did not hold
    Failed(String),
    /// Anything else went wrong: validation, compilation, backend
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub results: Vec<TestResult>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Failed(_)))
    }

    pub fn errored(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Error(_)))
    }

    /// True iff nothing failed or errored
    pub fn succeeded(&self) -> bool {
        self.failed() == 0 && self.errored() == 0
    }

    fn count(&self, pred: impl Fn(&TestOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct TestRunner<S = EnvSecrets> {
    executor: Executor<S>,
}

impl TestRunner<EnvSecrets> {
    pub fn from_env() -> Self {
        Self::new(Executor::from_env())
    }
}

impl<S: SecretResolver + Sync> TestRunner<S> {
    pub fn new(executor: Executor<S>) -> Self {
        Self { executor }
    }

    /// Run blocks one after another in source order
    pub fn run<B, F>(&self, program: &Program, backend: F) -> TestReport
    where
        B: TableBackend,
        F: Fn() -> Result<B, BackendError>,
    {
        let results = program
            .test_blocks()
            .map(|block| self.run_block(block, &backend))
            .collect();
        TestReport { results }
    }

    /// Run blocks on the rayon pool; results keep source order
    pub fn run_parallel<B, F>(&self, program: &Program, backend: F) -> TestReport
    where
        B: TableBackend,
        F: Fn() -> Result<B, BackendError> + Sync,
    {
        let blocks: Vec<&TestBlock> = program.test_blocks().collect();
        let results = blocks
            .par_iter()
            .map(|block| self.run_block(block, &backend))
            .collect();
        TestReport { results }
    }

    pub fn run_block<B, F>(&self, block: &TestBlock, backend: &F) -> TestResult
    where
        B: TableBackend,
        F: Fn() -> Result<B, BackendError>,
    {
        let outcome = self.outcome(block, backend);
        match &outcome {
            TestOutcome::Passed => info!(test = %block.name, "PASSED"),
            TestOutcome::Failed(detail) => warn!(test = %block.name, %detail, "FAILED"),
            TestOutcome::Error(detail) => warn!(test = %block.name, %detail, "ERROR"),
        }
        TestResult {
            name: block.name.clone(),
            outcome,
        }
    }

    fn outcome<B, F>(&self, block: &TestBlock, backend: &F) -> TestOutcome
    where
        B: TableBackend,
        F: Fn() -> Result<B, BackendError>,
    {
        let unit = match crate::compile(&block.statements) {
            Ok(unit) => unit,
            Err(err) => return TestOutcome::Error(err.to_string()),
        };
        let mut backend = match backend() {
            Ok(backend) => backend,
            Err(err) => return TestOutcome::Error(err.to_string()),
        };

        match self.executor.execute(&unit.operations, &mut backend) {
            Ok(_) => TestOutcome::Passed,
            Err(RuntimeError::AssertionFailed { assertion }) => TestOutcome::Failed(assertion),
            Err(err) => TestOutcome::Error(FlowError::from(err).to_string()),
        }
    }
}
