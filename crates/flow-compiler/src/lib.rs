//! Flow compiler
//!
//! Validation, code generation, execution and test running for Flow
//! programs:
//!
//! ```text
//! statements ─▶ Validator ─▶ PipelineCompiler ─▶ [Operation] ─▶ Executor ─▶ TableBackend
//! ```

pub mod compile;
pub mod env;
pub mod error;
pub mod exec;
pub mod expr;
pub mod test_runner;
pub mod validate;

use flow_ast::Statement;

pub use compile::{CompiledUnit, PipelineCompiler};
pub use env::{Binding, BindingEnv};
pub use error::{CompileError, FlowError, FlowResult, RuntimeError, ValidationError, ValidationKind};
pub use exec::{EnvSecrets, ExecutionReport, Executor, SecretResolver};
pub use test_runner::{TestOutcome, TestReport, TestResult, TestRunner};
pub use validate::{ValidationContext, Validator};

/// Validate, then generate code, with fresh state
pub fn compile(statements: &[Statement]) -> FlowResult<CompiledUnit> {
    Validator::new().validate(statements)?;
    Ok(PipelineCompiler::new().compile(statements)?)
}

/// Parse source text and compile its top-level statements
pub fn compile_str(source: &str) -> FlowResult<CompiledUnit> {
    let program = flow_ast::parse(source)?;
    compile(&program.statements)
}

pub mod prelude {
    pub use crate::{
        compile, compile_str, CompiledUnit, Executor, FlowError, TestOutcome, TestReport, TestRunner,
    };
    pub use flow_ir::{Operation, TableBackend};
}
