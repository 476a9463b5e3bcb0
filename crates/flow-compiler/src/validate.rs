//! Schema-aware validation
//!
//! Walks statements top to bottom and stops at the first violation. Each
//! pipeline gets its own [`ValidationContext`], seeded from a copy of the
//! start variable's registered schema, so nothing a pipeline does to its
//! working shape leaks into the registry or into the next pipeline.

use std::collections::HashMap;

use flow_ast::{AggregateExpr, Expr, JoinExpr, Pipeline, SourceDecl, Statement, Step};
use flow_ir::{FieldType, Schema};
use flow_registry::SchemaRegistry;
use tracing::debug;

use crate::env::{join_schema_name, BindingEnv};
use crate::error::{ValidationError, ValidationKind};

/// The working row shape at one point of one pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationContext {
    /// `None` once schema information is unavailable; checks are then skipped
    pub schema: Option<Schema>,
    pub schema_name: String,
    pub group_by: Vec<String>,
}

impl ValidationContext {
    fn enter(schema_name: Option<&str>, registry: &SchemaRegistry) -> Result<Self, ValidationError> {
        let schema = match schema_name {
            Some(name) => Some(registry.lookup(name)?.clone()),
            None => None,
        };
        Ok(Self {
            schema,
            schema_name: schema_name.unwrap_or_default().to_string(),
            group_by: Vec::new(),
        })
    }

    fn require(&self, column: &str, step: &str) -> Result<(), ValidationError> {
        match &self.schema {
            Some(schema) if !schema.contains(column) => {
                Err(ValidationError::unknown_column(column, &self.schema_name, step))
            }
            _ => Ok(()),
        }
    }

    fn require_all<'a>(
        &self,
        columns: impl IntoIterator<Item = &'a String>,
        step: &str,
    ) -> Result<(), ValidationError> {
        columns.into_iter().try_for_each(|c| self.require(c, step))
    }

    fn require_expr(&self, expr: &Expr, step: &str) -> Result<(), ValidationError> {
        expr.column_refs()
            .into_iter()
            .try_for_each(|col| self.require(&col.column, step))
    }
}

#[derive(Debug, Default)]
pub struct Validator {
    registry: SchemaRegistry,
    env: BindingEnv<()>,
    /// Row shape each variable ended with, where it is known
    shapes: HashMap<String, Schema>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn env(&self) -> &BindingEnv<()> {
        &self.env
    }

    /// The row shape `variable` was bound with, as of the last assignment
    pub fn shape_of(&self, variable: &str) -> Option<&Schema> {
        self.shapes.get(variable)
    }

    fn record_shape(&mut self, variable: &str, shape: Option<Schema>) {
        match shape {
            Some(shape) => self.shapes.insert(variable.to_string(), shape),
            None => self.shapes.remove(variable),
        };
    }

    /// Validate a statement list. Test blocks are skipped; they are
    /// validated in isolation by the test runner.
    pub fn validate(&mut self, statements: &[Statement]) -> Result<(), ValidationError> {
        statements.iter().try_for_each(|s| self.validate_statement(s))
    }

    fn validate_statement(&mut self, statement: &Statement) -> Result<(), ValidationError> {
        match statement {
            Statement::Schema(decl) => {
                self.registry.declare(
                    &decl.name,
                    decl.fields.iter().map(|f| (f.name.clone(), f.type_name.clone())),
                )?;
                Ok(())
            }
            Statement::Source(decl) => self.validate_source(decl),
            Statement::Sink(_) => Ok(()),
            Statement::Assignment { target, value } => match value {
                flow_ast::Assigned::Pipeline(pipeline) => {
                    let ctx = self.validate_pipeline(pipeline)?;
                    // The result carries the start variable's schema name even
                    // if steps reshaped it; only its shape tracks the steps
                    let schema = self.env.schema_of(&pipeline.start).map(str::to_string);
                    self.env.bind(target.clone(), (), schema);
                    self.record_shape(target, ctx.schema);
                    Ok(())
                }
                flow_ast::Assigned::Join(join) => {
                    let schema = self.validate_join(join)?;
                    self.env.bind(target.clone(), (), schema);
                    let shape = match (self.shapes.get(&join.left), self.shapes.get(&join.right)) {
                        (Some(l), Some(r)) => Some(l.merged_with(r)),
                        (Some(one), None) | (None, Some(one)) => Some(one.clone()),
                        (None, None) => None,
                    };
                    self.record_shape(target, shape);
                    Ok(())
                }
            },
            Statement::Execution(pipeline) => self.validate_pipeline(pipeline).map(|_| ()),
            Statement::Assert(expr) => self.validate_assertion(expr),
            Statement::Test(block) => {
                debug!(test = %block.name, "Skipping test block during validation");
                Ok(())
            }
        }
    }

    fn validate_source(&mut self, decl: &SourceDecl) -> Result<(), ValidationError> {
        if let Some(schema) = &decl.schema {
            if !self.registry.contains(schema) {
                return Err(ValidationError::new(
                    ValidationKind::UnknownSchema,
                    format!("source '{}' uses undeclared schema '{}'", decl.variable, schema),
                ));
            }
        }
        self.env.bind(decl.variable.clone(), (), decl.schema.clone());
        let shape = match &decl.schema {
            Some(name) => Some(self.registry.lookup(name)?.clone()),
            None => None,
        };
        self.record_shape(&decl.variable, shape);
        Ok(())
    }

    /// Validate one pipeline and return its final context
    pub fn validate_pipeline(&mut self, pipeline: &Pipeline) -> Result<ValidationContext, ValidationError> {
        self.env.resolve(&pipeline.start)?;
        let mut ctx = ValidationContext::enter(self.env.schema_of(&pipeline.start), &self.registry)?;

        for (index, step) in pipeline.steps.iter().enumerate() {
            if ctx.schema.is_none() {
                break;
            }
            let previous = index.checked_sub(1).map(|i| &pipeline.steps[i]);
            self.validate_step(&mut ctx, step, previous)?;
        }

        debug!(
            start = %pipeline.start,
            schema = %ctx.schema_name,
            validated = ctx.schema.is_some(),
            "Validated pipeline"
        );
        Ok(ctx)
    }

    fn validate_step(
        &mut self,
        ctx: &mut ValidationContext,
        step: &Step,
        previous: Option<&Step>,
    ) -> Result<(), ValidationError> {
        let name = step.name();
        match step {
            Step::Filter(expr) => ctx.require_expr(expr, name),
            Step::Select(columns) | Step::Sort { columns, .. } => ctx.require_all(columns, name),
            Step::Mutate(mutations) => {
                // Simultaneous assignment: right-hand sides see only the
                // pre-mutation shape
                for m in mutations {
                    ctx.require_expr(&m.expr, name)?;
                }
                if let Some(schema) = ctx.schema.as_mut() {
                    for m in mutations {
                        schema.upsert(m.column.clone(), FieldType::Unresolved);
                    }
                }
                Ok(())
            }
            Step::GroupBy(columns) => {
                ctx.require_all(columns, name)?;
                ctx.group_by = columns.clone();
                Ok(())
            }
            Step::Aggregate(aggs) => self.validate_aggregate(ctx, aggs, previous),
        }
    }

    fn validate_aggregate(
        &mut self,
        ctx: &mut ValidationContext,
        aggs: &[AggregateExpr],
        previous: Option<&Step>,
    ) -> Result<(), ValidationError> {
        if !matches!(previous, Some(Step::GroupBy(_))) {
            if !ctx.group_by.is_empty() {
                return Err(ValidationError::new(
                    ValidationKind::InvalidAggregateOrdering,
                    format!(
                        "aggregate must directly follow group_by({}) in schema '{}'",
                        ctx.group_by.join(", "),
                        ctx.schema_name
                    ),
                ));
            }
            // No grouping at all: the code generator rejects this pipeline
            ctx.schema = None;
            return Ok(());
        }

        let Some(before) = ctx.schema.take() else {
            return Ok(());
        };
        for agg in aggs {
            if let Some(column) = &agg.column {
                if !before.contains(column) {
                    return Err(ValidationError::unknown_column(column, &ctx.schema_name, "aggregate"));
                }
            }
        }

        let mut after = Schema::default();
        for column in &ctx.group_by {
            if let Some(field) = before.find_field(column) {
                after.upsert(field.name.clone(), field.field_type.clone());
            }
        }
        for agg in aggs {
            after.upsert(agg.name.clone(), FieldType::Aggregate);
        }

        ctx.schema_name = format!("{}::aggregate", ctx.schema_name);
        self.registry.register_derived(ctx.schema_name.clone(), after.clone());
        ctx.schema = Some(after);
        Ok(())
    }

    /// Validate a join in a context of its own, returning the result schema name
    pub fn validate_join(&mut self, join: &JoinExpr) -> Result<Option<String>, ValidationError> {
        self.env.resolve(&join.left)?;
        self.env.resolve(&join.right)?;

        let (a, b) = &join.on;
        let mut named = Vec::with_capacity(2);
        for side in [a, b] {
            let alias = match side.table.as_deref() {
                Some(alias) if alias == join.left || alias == join.right => alias,
                Some(alias) => {
                    return Err(ValidationError::new(
                        ValidationKind::UnknownTableAlias,
                        format!(
                            "'{}' in join condition is neither '{}' nor '{}'",
                            alias, join.left, join.right
                        ),
                    ))
                }
                None => {
                    return Err(ValidationError::new(
                        ValidationKind::UnknownTableAlias,
                        format!("join column '{}' must be qualified", side.column),
                    ))
                }
            };
            if let Some(schema_name) = self.env.schema_of(alias) {
                let schema = self.registry.lookup(schema_name)?;
                if !schema.contains(&side.column) {
                    return Err(ValidationError::unknown_column(&side.column, schema_name, "join"));
                }
            }
            named.push(alias);
        }

        if join.left != join.right && named[0] == named[1] {
            return Err(ValidationError::new(
                ValidationKind::InvalidJoinCondition,
                format!("both sides of the join condition refer to '{}'", named[0]),
            ));
        }

        let left = self.env.schema_of(&join.left).map(str::to_string);
        let right = self.env.schema_of(&join.right).map(str::to_string);
        let name = join_schema_name(left.as_deref(), right.as_deref());
        if let (Some(l), Some(r), Some(name)) = (&left, &right, &name) {
            let merged = self.registry.lookup(l)?.merged_with(self.registry.lookup(r)?);
            self.registry.register_derived(name.clone(), merged);
        }
        Ok(name)
    }

    fn validate_assertion(&self, expr: &Expr) -> Result<(), ValidationError> {
        for col in expr.column_refs() {
            let Some(variable) = col.table.as_deref() else {
                return Err(ValidationError::new(
                    ValidationKind::UnknownColumn,
                    format!("column '{}' in assertion must be qualified with a variable", col.column),
                ));
            };
            self.env.resolve(variable)?;
            if let Some(shape) = self.shapes.get(variable) {
                if !shape.contains(&col.column) {
                    return Err(ValidationError::new(
                        ValidationKind::UnknownColumn,
                        format!("column '{}' not found in variable '{}' (assert)", col.column, variable),
                    ));
                }
            }
        }
        Ok(())
    }
}
