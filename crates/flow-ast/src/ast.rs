//! AST types for Flow
//!
//! Minimal AST representation closely following the Pest grammar.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn test_blocks(&self) -> impl Iterator<Item = &TestBlock> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Test(block) => Some(block),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Schema(SchemaDecl),
    Source(SourceDecl),
    Sink(SinkDecl),
    Assignment { target: String, value: Assigned },
    Execution(Pipeline),
    Assert(Expr),
    Test(TestBlock),
}

/// `schema Name { field: Type, ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub type_name: String,
}

/// `var = Source.Kind(args) [using Schema]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    pub variable: String,
    pub call: Call,
    pub schema: Option<String>,
}

/// `sink name = Sink.Kind(args)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkDecl {
    pub name: String,
    pub call: Call,
}

/// `Kind(name: value, ...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub kind: String,
    pub args: Vec<Arg>,
}

impl Call {
    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.iter().find(|a| a.name == name).map(|a| &a.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub name: String,
    pub value: ArgValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    String(String),
    Number(String),
    Env(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Assigned {
    Pipeline(Pipeline),
    Join(JoinExpr),
}

/// `join(left, right, on: left.col == right.col)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinExpr {
    pub left: String,
    pub right: String,
    pub on: (ColumnRef, ColumnRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub start: String,
    pub steps: Vec<Step>,
    pub sink: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
    Filter(Expr),
    Select(Vec<String>),
    Sort { columns: Vec<String>, descending: bool },
    Mutate(Vec<Mutation>),
    GroupBy(Vec<String>),
    Aggregate(Vec<AggregateExpr>),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Filter(_) => "filter",
            Step::Select(_) => "select",
            Step::Sort { .. } => "sort",
            Step::Mutate(_) => "mutate",
            Step::GroupBy(_) => "group_by",
            Step::Aggregate(_) => "aggregate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub column: String,
    pub expr: Expr,
}

/// `name = func(column?)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub name: String,
    pub func: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBlock {
    pub name: String,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column(ColumnRef),
    BinaryOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
}

impl Expr {
    /// Every column reference, left to right
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(col) => out.push(col),
            Expr::BinaryOp { left, right, .. } => {
                left.collect_refs(out);
                right.collect_refs(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod,
    Eq, Ne, Lt, Le, Gt, Ge,
    And, Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => f.write_str(&self.column),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
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
        };
        f.write_str(symbol)
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

// Renders close to source form; nested operations get parentheses
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Column(col) => write!(f, "{}", col),
            Expr::BinaryOp { op, left, right } => {
                write_operand(f, left)?;
                write!(f, " {} ", op)?;
                write_operand(f, right)
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::BinaryOp { .. } => write!(f, "({})", expr),
        _ => write!(f, "{}", expr),
    }
}
