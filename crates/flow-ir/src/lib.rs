//! Flow Intermediate Representation (IR)
//!
//! The backend-neutral instruction stream produced by the compiler. Each
//! [`Operation`] consumes relation handles produced by earlier operations and
//! (except for sinks and assertions) produces exactly one fresh handle.
//! All types are deterministically serializable for caching and inspection.

use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

mod backend;
mod expr;
mod types;

pub use backend::{BackendError, TableBackend};
pub use expr::{BinOp, EvalError, Expr, NoColumns, Row, Value};
pub use types::*;

/// Opaque, compiler-allocated identifier of one relation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationHandle(u32);

impl RelationHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel_{}", self.0)
    }
}

/// Monotonic handle allocator, one per compilation unit.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    next: u32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    pub fn allocate(&mut self) -> RelationHandle {
        let handle = RelationHandle(self.next);
        self.next += 1;
        handle
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of the compiled instruction stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operation {
    Load {
        source: SourceSpec,
        output: RelationHandle,
    },
    Filter {
        input: RelationHandle,
        predicate: Expr,
        output: RelationHandle,
    },
    Select {
        input: RelationHandle,
        columns: Vec<String>,
        output: RelationHandle,
    },
    Sort {
        input: RelationHandle,
        by: Vec<String>,
        ascending: bool,
        output: RelationHandle,
    },
    Derive {
        input: RelationHandle,
        columns: Vec<DerivedColumn>,
        output: RelationHandle,
    },
    /// Grouped but not yet aggregated relation
    Group {
        input: RelationHandle,
        by: Vec<String>,
        output: RelationHandle,
    },
    GroupAggregate {
        input: RelationHandle,
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
        output: RelationHandle,
    },
    Join {
        left: RelationHandle,
        right: RelationHandle,
        left_on: String,
        right_on: String,
        output: RelationHandle,
    },
    Persist {
        input: RelationHandle,
        sink: SinkSpec,
    },
    Assert {
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<RelationHandle>,
        predicate: Expr,
        text: String,
    },
}

impl Operation {
    /// Short lowercase name, used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Load { .. } => "load",
            Operation::Filter { .. } => "filter",
            Operation::Select { .. } => "select",
            Operation::Sort { .. } => "sort",
            Operation::Derive { .. } => "derive",
            Operation::Group { .. } => "group",
            Operation::GroupAggregate { .. } => "group_aggregate",
            Operation::Join { .. } => "join",
            Operation::Persist { .. } => "persist",
            Operation::Assert { .. } => "assert",
        }
    }

    /// Handles this operation reads, in operand order
    pub fn inputs(&self) -> Vec<RelationHandle> {
        match self {
            Operation::Load { .. } => vec![],
            Operation::Filter { input, .. }
            | Operation::Select { input, .. }
            | Operation::Sort { input, .. }
            | Operation::Derive { input, .. }
            | Operation::Group { input, .. }
            | Operation::GroupAggregate { input, .. }
            | Operation::Persist { input, .. } => vec![*input],
            Operation::Join { left, right, .. } => vec![*left, *right],
            Operation::Assert { input, .. } => input.iter().copied().collect(),
        }
    }

    pub fn output(&self) -> Option<RelationHandle> {
        match self {
            Operation::Load { output, .. }
            | Operation::Filter { output, .. }
            | Operation::Select { output, .. }
            | Operation::Sort { output, .. }
            | Operation::Derive { output, .. }
            | Operation::Group { output, .. }
            | Operation::GroupAggregate { output, .. }
            | Operation::Join { output, .. } => Some(*output),
            Operation::Persist { .. } | Operation::Assert { .. } => None,
        }
    }

    /// Rewrite every handle (operands first, then the output)
    pub fn map_handles(&self, f: &mut impl FnMut(RelationHandle) -> RelationHandle) -> Operation {
        match self {
            Operation::Load { source, output } => Operation::Load {
                source: source.clone(),
                output: f(*output),
            },
            Operation::Filter { input, predicate, output } => {
                let input = f(*input);
                Operation::Filter {
                    input,
                    predicate: predicate.map_handles(f),
                    output: f(*output),
                }
            }
            Operation::Select { input, columns, output } => {
                let input = f(*input);
                Operation::Select {
                    input,
                    columns: columns.clone(),
                    output: f(*output),
                }
            }
            Operation::Sort { input, by, ascending, output } => {
                let input = f(*input);
                Operation::Sort {
                    input,
                    by: by.clone(),
                    ascending: *ascending,
                    output: f(*output),
                }
            }
            Operation::Derive { input, columns, output } => {
                let input = f(*input);
                let columns = columns
                    .iter()
                    .map(|c| DerivedColumn {
                        name: c.name.clone(),
                        expr: c.expr.map_handles(f),
                    })
                    .collect();
                Operation::Derive {
                    input,
                    columns,
                    output: f(*output),
                }
            }
            Operation::Group { input, by, output } => {
                let input = f(*input);
                Operation::Group {
                    input,
                    by: by.clone(),
                    output: f(*output),
                }
            }
            Operation::GroupAggregate { input, group_by, aggregations, output } => {
                let input = f(*input);
                Operation::GroupAggregate {
                    input,
                    group_by: group_by.clone(),
                    aggregations: aggregations.clone(),
                    output: f(*output),
                }
            }
            Operation::Join { left, right, left_on, right_on, output } => {
                let left = f(*left);
                let right = f(*right);
                Operation::Join {
                    left,
                    right,
                    left_on: left_on.clone(),
                    right_on: right_on.clone(),
                    output: f(*output),
                }
            }
            Operation::Persist { input, sink } => Operation::Persist {
                input: f(*input),
                sink: sink.clone(),
            },
            Operation::Assert { input, predicate, text } => {
                let input = input.map(&mut *f);
                Operation::Assert {
                    input,
                    predicate: predicate.map_handles(f),
                    text: text.clone(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedColumn {
    pub name: String,
    pub expr: Expr,
}

/// `name = func(column?)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub func: AggFunc,
}

/// Where a `Load` reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SourceSpec {
    File { path: String },
    Parquet { path: String },
    Postgres(PostgresSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresSource {
    pub user: String,
    pub password: Secret,
    pub host: String,
    pub database: String,
    pub table: String,
}

const REDACTED: &str = "<redacted>";

/// A credential, either inline or looked up at execution time
///
/// Inline values never appear in `Debug` or serialized output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub enum Secret {
    Literal(String),
    Env(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Literal(_) => f.debug_tuple("Literal").field(&REDACTED).finish(),
            Secret::Env(name) => f.debug_tuple("Env").field(name).finish(),
        }
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Secret::Literal(_) => serializer.serialize_newtype_variant("Secret", 0, "Literal", REDACTED),
            Secret::Env(name) => serializer.serialize_newtype_variant("Secret", 1, "Env", name),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("environment variable '{name}' is not set")]
pub struct MissingSecret {
    pub name: String,
}

impl SourceSpec {
    /// Resolve secrets, producing what a backend actually connects to
    pub fn resolve(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedSource, MissingSecret> {
        Ok(match self {
            SourceSpec::File { path } => ResolvedSource::File { path: path.clone() },
            SourceSpec::Parquet { path } => ResolvedSource::Parquet { path: path.clone() },
            SourceSpec::Postgres(pg) => {
                let password = match &pg.password {
                    Secret::Literal(value) => value.clone(),
                    Secret::Env(name) => lookup(name).ok_or_else(|| MissingSecret {
                        name: name.clone(),
                    })?,
                };
                ResolvedSource::Postgres(PostgresConnection {
                    user: pg.user.clone(),
                    password,
                    host: pg.host.clone(),
                    database: pg.database.clone(),
                    table: pg.table.clone(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    File { path: String },
    Parquet { path: String },
    Postgres(PostgresConnection),
}

#[derive(Clone, PartialEq, Eq)]
pub struct PostgresConnection {
    pub user: String,
    pub password: String,
    pub host: String,
    pub database: String,
    pub table: String,
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

/// Where a `Persist` writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SinkSpec {
    File { path: String },
    Parquet { path: String },
}

/// Renumber handles in order of first appearance
pub fn canonicalize(ops: &[Operation]) -> Vec<Operation> {
    let mut renamed: HashMap<RelationHandle, RelationHandle> = HashMap::new();
    ops.iter()
        .map(|op| {
            op.map_handles(&mut |h| {
                let next = RelationHandle(renamed.len() as u32 + 1);
                *renamed.entry(h).or_insert(next)
            })
        })
        .collect()
}

/// Calculate fingerprint (SHA-256) of an operation list, ignoring handle numbering
pub fn fingerprint(ops: &[Operation]) -> String {
    let json = serde_json::to_string(&canonicalize(ops)).expect("IR should always serialize");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}
