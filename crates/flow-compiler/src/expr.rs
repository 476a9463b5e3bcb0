//! Lower AST expressions to backend-neutral IR expressions

use flow_ast as ast;
use flow_ir::{self as ir, RelationHandle};

use crate::env::BindingEnv;
use crate::error::{CompileError, ValidationError, ValidationKind};

/// Lower a step expression. Qualifiers are accepted and ignored; every
/// reference is to the relation currently flowing through the pipeline.
pub fn lower_expr(expr: &ast::Expr) -> ir::Expr {
    match expr {
        ast::Expr::Literal(value) => ir::Expr::literal(lower_value(value)),
        ast::Expr::Column(col) => ir::Expr::column(col.column.clone()),
        ast::Expr::BinaryOp { op, left, right } => {
            ir::Expr::binary(lower_op(*op), lower_expr(left), lower_expr(right))
        }
    }
}

/// Lower an assertion predicate.
///
/// Every column must be qualified with one and the same variable; the
/// returned handle is that variable's relation, or `None` when the
/// predicate references no columns.
pub fn lower_assertion(
    expr: &ast::Expr,
    env: &BindingEnv<RelationHandle>,
) -> Result<(Option<RelationHandle>, ir::Expr), CompileError> {
    let mut variable: Option<&str> = None;
    for col in expr.column_refs() {
        let Some(table) = col.table.as_deref() else {
            return Err(ValidationError::new(
                ValidationKind::UnknownColumn,
                format!("column '{}' in assertion must be qualified with a variable", col.column),
            )
            .into());
        };
        match variable {
            Some(seen) if seen != table => {
                return Err(CompileError::UnsupportedAssertion(expr.to_string()));
            }
            _ => variable = Some(table),
        }
    }

    let Some(variable) = variable else {
        return Ok((None, lower_expr(expr)));
    };
    let input = env.resolve(variable)?;
    Ok((Some(input), lower_bound(expr, input)))
}

fn lower_bound(expr: &ast::Expr, input: RelationHandle) -> ir::Expr {
    match expr {
        ast::Expr::Literal(value) => ir::Expr::literal(lower_value(value)),
        ast::Expr::Column(col) => ir::Expr::InputColumn {
            input,
            name: col.column.clone(),
        },
        ast::Expr::BinaryOp { op, left, right } => {
            ir::Expr::binary(lower_op(*op), lower_bound(left, input), lower_bound(right, input))
        }
    }
}

fn lower_value(value: &ast::Value) -> ir::Value {
    match value {
        ast::Value::Null => ir::Value::Null,
        ast::Value::Bool(b) => ir::Value::Bool(*b),
        ast::Value::Int(i) => ir::Value::Int(*i),
        ast::Value::Float(x) => ir::Value::Float(*x),
        ast::Value::String(s) => ir::Value::String(s.clone()),
    }
}

fn lower_op(op: ast::BinOp) -> ir::BinOp {
    match op {
        ast::BinOp::Add => ir::BinOp::Add,
        ast::BinOp::Sub => ir::BinOp::Sub,
        ast::BinOp::Mul => ir::BinOp::Mul,
        ast::BinOp::Div => ir::BinOp::Div,
        ast::BinOp::Mod => ir::BinOp::Mod,
        ast::BinOp::Eq => ir::BinOp::Eq,
        ast::BinOp::Ne => ir::BinOp::Ne,
        ast::BinOp::Lt => ir::BinOp::Lt,
        ast::BinOp::Le => ir::BinOp::Le,
        ast::BinOp::Gt => ir::BinOp::Gt,
        ast::BinOp::Ge => ir::BinOp::Ge,
        ast::BinOp::And => ir::BinOp::And,
        ast::BinOp::Or => ir::BinOp::Or,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_ir::HandleAllocator;

    fn parse(source: &str) -> ast::Expr {
        flow_ast::parse_expr(source).unwrap()
    }

    #[test]
    fn test_lower_keeps_left_associativity() {
        let lowered = lower_expr(&parse("a - b - 1"));
        let expected = ir::Expr::binary(
            ir::BinOp::Sub,
            ir::Expr::binary(ir::BinOp::Sub, ir::Expr::column("a"), ir::Expr::column("b")),
            ir::Expr::literal(ir::Value::Int(1)),
        );
        assert_eq!(lowered, expected);
    }

    #[test]
    fn test_qualifier_ignored_in_steps() {
        assert_eq!(lower_expr(&parse("orders.amount")), ir::Expr::column("amount"));
    }

    #[test]
    fn test_assertion_binds_variable_handle() {
        let mut handles = HandleAllocator::new();
        let mut env = BindingEnv::new();
        let handle = handles.allocate();
        env.bind("out", handle, None);

        let (input, predicate) = lower_assertion(&parse("out.total >= 0"), &env).unwrap();
        assert_eq!(input, Some(handle));
        assert_eq!(
            predicate,
            ir::Expr::binary(
                ir::BinOp::Ge,
                ir::Expr::InputColumn {
                    input: handle,
                    name: "total".to_string()
                },
                ir::Expr::literal(ir::Value::Int(0)),
            )
        );
    }

    #[test]
    fn test_literal_assertion_has_no_input() {
        let env = BindingEnv::new();
        let (input, predicate) = lower_assertion(&parse("1 + 1 == 2"), &env).unwrap();
        assert_eq!(input, None);
        assert!(!predicate.references_columns());
    }

    #[test]
    fn test_assertion_rejects_two_variables() {
        let mut handles = HandleAllocator::new();
        let mut env = BindingEnv::new();
        env.bind("a", handles.allocate(), None);
        env.bind("b", handles.allocate(), None);

        let err = lower_assertion(&parse("a.x == b.x"), &env).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedAssertion(_)));
    }

    #[test]
    fn test_assertion_rejects_unqualified_column() {
        let env = BindingEnv::new();
        let err = lower_assertion(&parse("x > 1"), &env).unwrap_err();
        match err {
            CompileError::Unresolved(e) => assert_eq!(e.kind, ValidationKind::UnknownColumn),
            other => panic!("unexpected error: {other}"),
        }
    }
}
