//! Pest-based parser for Flow

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use crate::ast::*;

#[derive(Parser)]
#[grammar = "flow.pest"]
pub struct FlowParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Pest error: {0}")]
    Pest(#[from] Box<pest::error::Error<Rule>>),
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        ParseError::Pest(Box::new(err))
    }
}

/// Parse Flow source text into AST
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut pairs = FlowParser::parse(Rule::program, source)?;
    let program_pair = pairs.next().ok_or_else(|| ParseError::Syntax("Empty input".to_string()))?;

    let mut statements = Vec::new();
    for pair in program_pair.into_inner() {
        if pair.as_rule() == Rule::EOI {
            continue;
        }
        statements.push(parse_statement(pair, false)?);
    }

    Ok(Program { statements })
}

/// Parse a single expression, e.g. for tooling and tests
pub fn parse_expr(source: &str) -> Result<Expr, ParseError> {
    let mut pairs = FlowParser::parse(Rule::bool_expr, source.trim())?;
    let pair = pairs.next().ok_or_else(|| ParseError::Syntax("Empty expression".to_string()))?;
    if pair.as_str().len() != source.trim().len() {
        return Err(ParseError::Syntax(format!("Unexpected input after expression: {}", source)));
    }
    parse_bool_expr(pair)
}

fn next<'a>(inner: &mut Pairs<'a, Rule>, what: &str) -> Result<Pair<'a, Rule>, ParseError> {
    inner.next().ok_or_else(|| ParseError::Syntax(format!("Missing {}", what)))
}

fn ident(inner: &mut Pairs<'_, Rule>, what: &str) -> Result<String, ParseError> {
    Ok(next(inner, what)?.as_str().to_string())
}

fn parse_statement(pair: Pair<'_, Rule>, in_test: bool) -> Result<Statement, ParseError> {
    match pair.as_rule() {
        Rule::schema_decl => parse_schema_decl(pair).map(Statement::Schema),
        Rule::sink_decl => {
            let mut inner = pair.into_inner();
            next(&mut inner, "sink keyword")?;
            let name = ident(&mut inner, "sink name")?;
            let call = parse_call(next(&mut inner, "sink call")?)?;
            Ok(Statement::Sink(SinkDecl { name, call }))
        }
        Rule::test_block => {
            if in_test {
                return Err(ParseError::Syntax("Test blocks cannot be nested".to_string()));
            }
            let mut inner = pair.into_inner();
            next(&mut inner, "test keyword")?;
            let name = parse_string(next(&mut inner, "test name")?);
            let statements = inner
                .map(|p| parse_statement(p, true))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Statement::Test(TestBlock { name, statements }))
        }
        Rule::assert_stmt => {
            let mut inner = pair.into_inner();
            next(&mut inner, "assert keyword")?;
            let expr = parse_bool_expr(next(&mut inner, "assertion")?)?;
            Ok(Statement::Assert(expr))
        }
        Rule::assignment => parse_assignment(pair),
        Rule::execution => {
            let pipeline = parse_pipeline(next(&mut pair.into_inner(), "pipeline")?)?;
            Ok(Statement::Execution(pipeline))
        }
        other => Err(ParseError::Syntax(format!("Unexpected statement: {:?}", other))),
    }
}

fn parse_schema_decl(pair: Pair<'_, Rule>) -> Result<SchemaDecl, ParseError> {
    let mut inner = pair.into_inner();
    next(&mut inner, "schema keyword")?;
    let name = ident(&mut inner, "schema name")?;

    let fields = inner
        .map(|field| {
            let mut parts = field.into_inner();
            Ok(FieldDecl {
                name: ident(&mut parts, "field name")?,
                type_name: ident(&mut parts, "field type")?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(SchemaDecl { name, fields })
}

fn parse_assignment(pair: Pair<'_, Rule>) -> Result<Statement, ParseError> {
    let mut inner = pair.into_inner();
    let target = ident(&mut inner, "assignment target")?;
    let value = next(&mut inner, "assigned value")?;

    match value.as_rule() {
        Rule::source_call => {
            let mut parts = value.into_inner();
            let call = parse_call(next(&mut parts, "source call")?)?;
            let schema = match parts.next() {
                Some(using) => {
                    let mut using = using.into_inner();
                    next(&mut using, "using keyword")?;
                    Some(ident(&mut using, "schema name")?)
                }
                None => None,
            };
            Ok(Statement::Source(SourceDecl {
                variable: target,
                call,
                schema,
            }))
        }
        Rule::join_expr => {
            let mut parts = value.into_inner();
            let left = ident(&mut parts, "left join operand")?;
            let right = ident(&mut parts, "right join operand")?;
            let mut condition = next(&mut parts, "join condition")?.into_inner();
            let on_left = parse_qualified_ref(next(&mut condition, "join column")?)?;
            let on_right = parse_qualified_ref(next(&mut condition, "join column")?)?;
            Ok(Statement::Assignment {
                target,
                value: Assigned::Join(JoinExpr {
                    left,
                    right,
                    on: (on_left, on_right),
                }),
            })
        }
        Rule::pipeline => Ok(Statement::Assignment {
            target,
            value: Assigned::Pipeline(parse_pipeline(value)?),
        }),
        other => Err(ParseError::Syntax(format!("Invalid assignment value: {:?}", other))),
    }
}

fn parse_call(pair: Pair<'_, Rule>) -> Result<Call, ParseError> {
    let mut inner = pair.into_inner();
    let kind = ident(&mut inner, "call kind")?;

    let mut args = Vec::new();
    if let Some(arg_list) = inner.next() {
        for arg in arg_list.into_inner() {
            let mut parts = arg.into_inner();
            let name = ident(&mut parts, "argument name")?;
            let value = next(&mut parts, "argument value")?;
            let value = match value.as_rule() {
                Rule::string => ArgValue::String(parse_string(value)),
                Rule::number => ArgValue::Number(value.as_str().to_string()),
                Rule::env_ref => ArgValue::Env(parse_string(next(&mut value.into_inner(), "variable name")?)),
                other => return Err(ParseError::Syntax(format!("Invalid argument value: {:?}", other))),
            };
            args.push(Arg { name, value });
        }
    }

    Ok(Call { kind, args })
}

fn parse_qualified_ref(pair: Pair<'_, Rule>) -> Result<ColumnRef, ParseError> {
    let mut inner = pair.into_inner();
    let table = ident(&mut inner, "table alias")?;
    let column = ident(&mut inner, "column")?;
    Ok(ColumnRef {
        table: Some(table),
        column,
    })
}

fn parse_pipeline(pair: Pair<'_, Rule>) -> Result<Pipeline, ParseError> {
    let mut inner = pair.into_inner();
    let start = ident(&mut inner, "pipeline start")?;

    let mut steps = Vec::new();
    let mut sink = None;
    for item in inner {
        if let Some(name) = &sink {
            return Err(ParseError::Syntax(format!(
                "Sink '{}' must be the last item of the pipeline",
                name
            )));
        }
        match item.as_rule() {
            Rule::sink_ref => sink = Some(item.as_str().to_string()),
            _ => steps.push(parse_step(item)?),
        }
    }

    Ok(Pipeline { start, steps, sink })
}

fn idents(pair: Pair<'_, Rule>) -> Vec<String> {
    pair.into_inner().map(|p| p.as_str().to_string()).collect()
}

fn parse_step(pair: Pair<'_, Rule>) -> Result<Step, ParseError> {
    match pair.as_rule() {
        Rule::filter_step => {
            let expr = parse_bool_expr(next(&mut pair.into_inner(), "filter condition")?)?;
            Ok(Step::Filter(expr))
        }
        Rule::select_step => Ok(Step::Select(idents(next(&mut pair.into_inner(), "columns")?))),
        Rule::sort_step => {
            let mut columns = Vec::new();
            let mut descending = false;
            // The last direction keyword wins
            for arg in pair.into_inner() {
                match arg.as_rule() {
                    Rule::sort_order => descending = arg.as_str() == "desc",
                    _ => columns.push(arg.as_str().to_string()),
                }
            }
            if columns.is_empty() {
                return Err(ParseError::Syntax("sort needs at least one column".to_string()));
            }
            Ok(Step::Sort { columns, descending })
        }
        Rule::mutate_step => {
            let mutations = pair
                .into_inner()
                .map(|m| {
                    let mut parts = m.into_inner();
                    Ok(Mutation {
                        column: ident(&mut parts, "mutated column")?,
                        expr: parse_bool_expr(next(&mut parts, "mutation expression")?)?,
                    })
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(Step::Mutate(mutations))
        }
        Rule::group_by_step => Ok(Step::GroupBy(idents(next(&mut pair.into_inner(), "columns")?))),
        Rule::aggregate_step => {
            let aggs = pair
                .into_inner()
                .map(|a| {
                    let mut parts = a.into_inner();
                    Ok(AggregateExpr {
                        name: ident(&mut parts, "aggregate name")?,
                        func: ident(&mut parts, "aggregate function")?,
                        column: parts.next().map(|p| p.as_str().to_string()),
                    })
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(Step::Aggregate(aggs))
        }
        other => Err(ParseError::Syntax(format!("Unknown step: {:?}", other))),
    }
}

// Each precedence level is `operand (op operand)*`, folded left to right
fn fold_binary(
    pair: Pair<'_, Rule>,
    operand: fn(Pair<'_, Rule>) -> Result<Expr, ParseError>,
) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let mut left = operand(next(&mut inner, "operand")?)?;

    while let Some(op_pair) = inner.next() {
        let op = parse_op(op_pair.as_str())?;
        let right = operand(next(&mut inner, "right operand")?)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }

    Ok(left)
}

fn parse_op(op: &str) -> Result<BinOp, ParseError> {
    Ok(match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Mod,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "and" | "&&" => BinOp::And,
        "or" | "||" => BinOp::Or,
        _ => return Err(ParseError::Syntax(format!("Unknown operator: {}", op))),
    })
}

fn parse_bool_expr(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    fold_binary(pair, parse_comparison)
}

fn parse_comparison(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    fold_binary(pair, parse_arith)
}

fn parse_arith(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    fold_binary(pair, parse_term)
}

fn parse_term(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    fold_binary(pair, parse_factor)
}

fn parse_factor(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    let inner = next(&mut pair.into_inner(), "factor")?;
    match inner.as_rule() {
        Rule::literal => parse_literal(inner),
        Rule::column_ref => {
            let parts: Vec<_> = inner.into_inner().collect();
            let col = match parts.as_slice() {
                [column] => ColumnRef {
                    table: None,
                    column: column.as_str().to_string(),
                },
                [table, column] => ColumnRef {
                    table: Some(table.as_str().to_string()),
                    column: column.as_str().to_string(),
                },
                _ => return Err(ParseError::Syntax("Invalid column reference".to_string())),
            };
            Ok(Expr::Column(col))
        }
        Rule::bool_expr => parse_bool_expr(inner),
        other => Err(ParseError::Syntax(format!("Invalid factor: {:?}", other))),
    }
}

fn parse_literal(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    let inner = next(&mut pair.into_inner(), "literal")?;
    let value = match inner.as_rule() {
        Rule::number => {
            let text = inner.as_str();
            if text.contains('.') {
                Value::Float(text.parse().map_err(|_| ParseError::Syntax(format!("Invalid number: {}", text)))?)
            } else {
                Value::Int(text.parse().map_err(|_| ParseError::Syntax(format!("Invalid number: {}", text)))?)
            }
        }
        Rule::string => Value::String(parse_string(inner)),
        Rule::boolean => Value::Bool(inner.as_str() == "true"),
        Rule::null => Value::Null,
        other => return Err(ParseError::Syntax(format!("Invalid literal: {:?}", other))),
    };
    Ok(Expr::Literal(value))
}

/// Unquote a `string` pair, resolving backslash escapes
fn parse_string(pair: Pair<'_, Rule>) -> String {
    let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
