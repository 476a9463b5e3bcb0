//! Backend-neutral expression tree

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::RelationHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    /// Column of the relation currently being evaluated
    Column { name: String },
    /// Column of a named input relation
    InputColumn { input: RelationHandle, name: String },
    BinaryOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    // Arithmetic
    Add, Sub, Mul, Div, Mod,
    // Comparison
    Eq, Ne, Lt, Le, Gt, Ge,
    // Logical
    And, Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Only `Bool(true)` satisfies a predicate; null does not
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value } => write!(f, "{}", value),
            Expr::Column { name } => f.write_str(name),
            Expr::InputColumn { input, name } => write!(f, "{}.{}", input, name),
            Expr::BinaryOp { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("column '{0}' is not available")]
    UnknownColumn(String),

    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,
}

/// Column lookup for row-at-a-time evaluation
pub trait Row {
    fn get(&self, column: &str) -> Option<Value>;
}

impl Row for HashMap<String, Value> {
    fn get(&self, column: &str) -> Option<Value> {
        HashMap::get(self, column).cloned()
    }
}

/// Row context for predicates that reference no columns
pub struct NoColumns;

impl Row for NoColumns {
    fn get(&self, _column: &str) -> Option<Value> {
        None
    }
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into() }
    }

    pub fn literal(value: Value) -> Self {
        Expr::Literal { value }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True if any column (current or named input) is referenced
    pub fn references_columns(&self) -> bool {
        match self {
            Expr::Literal { .. } => false,
            Expr::Column { .. } | Expr::InputColumn { .. } => true,
            Expr::BinaryOp { left, right, .. } => left.references_columns() || right.references_columns(),
        }
    }

    pub(crate) fn map_handles(&self, f: &mut impl FnMut(RelationHandle) -> RelationHandle) -> Expr {
        match self {
            Expr::InputColumn { input, name } => Expr::InputColumn {
                input: f(*input),
                name: name.clone(),
            },
            Expr::BinaryOp { op, left, right } => {
                let left = left.map_handles(f);
                let right = right.map_handles(f);
                Expr::binary(*op, left, right)
            }
            other => other.clone(),
        }
    }

    /// Evaluate against one row. Both operands are always evaluated.
    pub fn eval(&self, row: &dyn Row) -> Result<Value, EvalError> {
        match self {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Column { name } | Expr::InputColumn { name, .. } => {
                row.get(name).ok_or_else(|| EvalError::UnknownColumn(name.clone()))
            }
            Expr::BinaryOp { op, left, right } => {
                let left = left.eval(row)?;
                let right = right.eval(row)?;
                apply(*op, left, right)
            }
        }
    }
}

fn apply(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    let mismatch = |l: &Value, r: &Value| EvalError::TypeMismatch {
        op: op.symbol(),
        left: l.type_name(),
        right: r.type_name(),
    };

    match op {
        BinOp::And | BinOp::Or => logical(op, &left, &right).ok_or_else(|| mismatch(&left, &right)),
        _ if matches!(left, Value::Null) || matches!(right, Value::Null) => Ok(Value::Null),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| mismatch(&left, &right))?;
            let result = match op {
                BinOp::Eq => ordering == Ordering::Equal,
                BinOp::Ne => ordering != Ordering::Equal,
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(l + &r)),
            (l, r) => arithmetic(op, &l, &r)?.ok_or_else(|| mismatch(&l, &r)),
        },
        _ => arithmetic(op, &left, &right)?.ok_or_else(|| mismatch(&left, &right)),
    }
}

// SQL three-valued logic
fn logical(op: BinOp, left: &Value, right: &Value) -> Option<Value> {
    let as_bool = |v: &Value| match v {
        Value::Bool(b) => Some(Some(*b)),
        Value::Null => Some(None),
        _ => None,
    };
    let (l, r) = (as_bool(left)?, as_bool(right)?);
    let result = match (op, l, r) {
        (BinOp::And, Some(false), _) | (BinOp::And, _, Some(false)) => Some(false),
        (BinOp::And, Some(true), Some(true)) => Some(true),
        (BinOp::Or, Some(true), _) | (BinOp::Or, _, Some(true)) => Some(true),
        (BinOp::Or, Some(false), Some(false)) => Some(false),
        _ => None,
    };
    Some(result.map(Value::Bool).unwrap_or(Value::Null))
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Option<Value>, EvalError> {
    if let (Value::Int(l), Value::Int(r)) = (left, right) {
        let value = match op {
            BinOp::Add => Value::Int(l.wrapping_add(*r)),
            BinOp::Sub => Value::Int(l.wrapping_sub(*r)),
            BinOp::Mul => Value::Int(l.wrapping_mul(*r)),
            BinOp::Mod if *r == 0 => return Err(EvalError::DivisionByZero),
            BinOp::Mod => Value::Int(l.wrapping_rem(*r)),
            BinOp::Div if *r == 0 => return Err(EvalError::DivisionByZero),
            BinOp::Div => Value::Float(*l as f64 / *r as f64),
            _ => return Ok(None),
        };
        return Ok(Some(value));
    }

    let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
        return Ok(None);
    };
    let value = match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div if r == 0.0 => return Err(EvalError::DivisionByZero),
        BinOp::Div => l / r,
        BinOp::Mod if r == 0.0 => return Err(EvalError::DivisionByZero),
        BinOp::Mod => l % r,
        _ => return Ok(None),
    };
    Ok(Some(Value::Float(value)))
}
