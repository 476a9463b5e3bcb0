//! Code generation: validated statements → ordered [`Operation`] list
//!
//! Every step consumes the running handle and produces a freshly allocated
//! one. Schemas play no part here; the validator has already checked them.

use std::collections::HashMap;

use flow_ast::{self as ast, ArgValue, Assigned, Call, JoinExpr, Pipeline, Statement, Step};
use flow_ir::{
    fingerprint, Aggregation, DerivedColumn, HandleAllocator, Operation, PostgresSource, RelationHandle, Secret,
    SinkSpec, SourceSpec,
};
use flow_registry::FunctionRegistry;
use serde::Serialize;
use tracing::{debug, info};

use crate::env::{join_schema_name, BindingEnv};
use crate::error::{CompileError, ValidationError, ValidationKind};
use crate::expr::{lower_assertion, lower_expr};

/// Output of one compilation unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledUnit {
    pub operations: Vec<Operation>,
}

impl CompiledUnit {
    /// Stable across handle numbering
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.operations)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

pub struct PipelineCompiler {
    env: BindingEnv<RelationHandle>,
    handles: HandleAllocator,
    sinks: HashMap<String, SinkSpec>,
    functions: FunctionRegistry,
    operations: Vec<Operation>,
}

impl PipelineCompiler {
    pub fn new() -> Self {
        Self::with_allocator(HandleAllocator::new())
    }

    pub fn with_allocator(handles: HandleAllocator) -> Self {
        Self {
            env: BindingEnv::new(),
            handles,
            sinks: HashMap::new(),
            functions: FunctionRegistry::default(),
            operations: Vec::new(),
        }
    }

    pub fn env(&self) -> &BindingEnv<RelationHandle> {
        &self.env
    }

    /// Compile a statement list. Test blocks are not part of the unit.
    pub fn compile(mut self, statements: &[Statement]) -> Result<CompiledUnit, CompileError> {
        for statement in statements {
            self.compile_statement(statement)?;
        }
        info!(operations = self.operations.len(), "Compiled unit");
        Ok(CompiledUnit {
            operations: self.operations,
        })
    }

    fn compile_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Schema(_) => {}
            Statement::Source(decl) => {
                let source = compile_source(&decl.call)?;
                let output = self.handles.allocate();
                self.emit(Operation::Load { source, output });
                self.env.bind(decl.variable.clone(), output, decl.schema.clone());
            }
            Statement::Sink(decl) => {
                let sink = compile_sink(&decl.call)?;
                self.sinks.insert(decl.name.clone(), sink);
            }
            Statement::Assignment { target, value } => match value {
                Assigned::Pipeline(pipeline) => {
                    let handle = self.compile_pipeline(pipeline)?;
                    let schema = self.env.schema_of(&pipeline.start).map(str::to_string);
                    self.env.bind(target.clone(), handle, schema);
                }
                Assigned::Join(join) => {
                    let handle = self.compile_join(join)?;
                    let schema = join_schema_name(self.env.schema_of(&join.left), self.env.schema_of(&join.right));
                    self.env.bind(target.clone(), handle, schema);
                }
            },
            Statement::Execution(pipeline) => {
                self.compile_pipeline(pipeline)?;
            }
            Statement::Assert(expr) => self.compile_assert(expr)?,
            Statement::Test(block) => debug!(test = %block.name, "Test block left to the test runner"),
        }
        Ok(())
    }

    /// Emit one operation per step; returns the final handle
    pub fn compile_pipeline(&mut self, pipeline: &Pipeline) -> Result<RelationHandle, CompileError> {
        let mut current = self.env.resolve(&pipeline.start)?;

        for (index, step) in pipeline.steps.iter().enumerate() {
            let op = match step {
                Step::Filter(expr) => Operation::Filter {
                    input: current,
                    predicate: lower_expr(expr),
                    output: self.handles.allocate(),
                },
                Step::Select(columns) => Operation::Select {
                    input: current,
                    columns: columns.clone(),
                    output: self.handles.allocate(),
                },
                Step::Sort { columns, descending } => Operation::Sort {
                    input: current,
                    by: columns.clone(),
                    ascending: !descending,
                    output: self.handles.allocate(),
                },
                Step::Mutate(mutations) => Operation::Derive {
                    input: current,
                    columns: mutations
                        .iter()
                        .map(|m| DerivedColumn {
                            name: m.column.clone(),
                            expr: lower_expr(&m.expr),
                        })
                        .collect(),
                    output: self.handles.allocate(),
                },
                Step::GroupBy(columns) => Operation::Group {
                    input: current,
                    by: columns.clone(),
                    output: self.handles.allocate(),
                },
                Step::Aggregate(aggs) => {
                    let previous = index.checked_sub(1).map(|i| &pipeline.steps[i]);
                    let Some(Step::GroupBy(group_by)) = previous else {
                        return Err(CompileError::AggregateWithoutGroupBy {
                            pipeline: pipeline.start.clone(),
                        });
                    };
                    Operation::GroupAggregate {
                        input: current,
                        group_by: group_by.clone(),
                        aggregations: self.compile_aggregations(aggs)?,
                        output: self.handles.allocate(),
                    }
                }
            };
            // Every step-generated operation has an output
            if let Some(output) = op.output() {
                current = output;
            }
            self.emit(op);
        }

        if let Some(sink_name) = &pipeline.sink {
            let sink = self
                .sinks
                .get(sink_name)
                .cloned()
                .ok_or_else(|| CompileError::UnknownSink(sink_name.clone()))?;
            self.emit(Operation::Persist { input: current, sink });
        }

        Ok(current)
    }

    fn compile_aggregations(&self, aggs: &[ast::AggregateExpr]) -> Result<Vec<Aggregation>, CompileError> {
        aggs.iter()
            .map(|agg| {
                let func = self
                    .functions
                    .resolve(&agg.func, agg.column.is_some())
                    .map_err(|source| CompileError::Aggregate {
                        name: agg.name.clone(),
                        source,
                    })?;
                Ok(Aggregation {
                    name: agg.name.clone(),
                    column: agg.column.clone(),
                    func,
                })
            })
            .collect()
    }

    fn compile_join(&mut self, join: &JoinExpr) -> Result<RelationHandle, CompileError> {
        let left = self.env.resolve(&join.left)?;
        let right = self.env.resolve(&join.right)?;

        let (a, b) = &join.on;
        let names = |side: &ast::ColumnRef, alias: &str| side.table.as_deref() == Some(alias);
        let (left_on, right_on) = if names(a, &join.left) && names(b, &join.right) {
            (a.column.clone(), b.column.clone())
        } else if names(b, &join.left) && names(a, &join.right) {
            (b.column.clone(), a.column.clone())
        } else {
            return Err(ValidationError::new(
                ValidationKind::UnknownTableAlias,
                format!("join condition {} == {} does not name '{}' and '{}'", a, b, join.left, join.right),
            )
            .into());
        };

        let output = self.handles.allocate();
        self.emit(Operation::Join {
            left,
            right,
            left_on,
            right_on,
            output,
        });
        Ok(output)
    }

    fn compile_assert(&mut self, expr: &ast::Expr) -> Result<(), CompileError> {
        let (input, predicate) = lower_assertion(expr, &self.env)?;
        self.emit(Operation::Assert {
            input,
            predicate,
            text: expr.to_string(),
        });
        Ok(())
    }

    fn emit(&mut self, op: Operation) {
        debug!(op = op.kind(), output = ?op.output(), "Emitted operation");
        self.operations.push(op);
    }
}

impl Default for PipelineCompiler {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_source(call: &Call) -> Result<SourceSpec, CompileError> {
    Ok(match call.kind.as_str() {
        "File" => SourceSpec::File {
            path: plain_arg(call, "path")?,
        },
        "Parquet" => SourceSpec::Parquet {
            path: plain_arg(call, "path")?,
        },
        "Postgres" => SourceSpec::Postgres(PostgresSource {
            user: plain_arg(call, "user")?,
            password: match required_arg(call, "password")? {
                ArgValue::Env(name) => Secret::Env(name.clone()),
                ArgValue::String(value) | ArgValue::Number(value) => Secret::Literal(value.clone()),
            },
            host: plain_arg(call, "host")?,
            database: plain_arg(call, "database")?,
            table: plain_arg(call, "table")?,
        }),
        other => return Err(CompileError::UnknownSourceKind(other.to_string())),
    })
}

fn compile_sink(call: &Call) -> Result<SinkSpec, CompileError> {
    Ok(match call.kind.as_str() {
        "File" => SinkSpec::File {
            path: plain_arg(call, "path")?,
        },
        "Parquet" => SinkSpec::Parquet {
            path: plain_arg(call, "path")?,
        },
        other => return Err(CompileError::UnknownSinkKind(other.to_string())),
    })
}

fn required_arg<'a>(call: &'a Call, name: &str) -> Result<&'a ArgValue, CompileError> {
    call.arg(name).ok_or_else(|| CompileError::MissingArgument {
        kind: call.kind.clone(),
        argument: name.to_string(),
    })
}

// Only secrets may come from the environment
fn plain_arg(call: &Call, name: &str) -> Result<String, CompileError> {
    match required_arg(call, name)? {
        ArgValue::String(value) | ArgValue::Number(value) => Ok(value.clone()),
        ArgValue::Env(_) => Err(CompileError::InvalidArgument {
            kind: call.kind.clone(),
            argument: name.to_string(),
        }),
    }
}
