//! Flow AST - parser and AST types

pub mod ast;
pub mod parser;

pub use ast::*;
pub use parser::{parse, parse_expr, ParseError};
