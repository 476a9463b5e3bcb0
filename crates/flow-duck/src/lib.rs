//! DuckDB backend for Flow operations
//!
//! Every relation handle becomes a temporary table (or, for grouped
//! relations, a view) named after the handle.

mod sql;

use std::collections::HashSet;
use std::path::Path;

use duckdb::{Connection, Result as DuckResult};
use flow_ir::{
    Aggregation, BackendError, DerivedColumn, Expr, PostgresConnection, RelationHandle, ResolvedSource, SinkSpec,
    TableBackend, Value,
};
use thiserror::Error;
use tracing::debug;

pub use sql::{postgres_dsn, quote_ident, quote_literal, render_expr};
use sql::{column_list, render_aggregation};

#[derive(Debug, Error)]
pub enum DuckError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Unknown relation: {0}")]
    UnknownRelation(RelationHandle),
}

/// Rows of one relation, for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, name: &str) -> Option<Vec<Value>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[index].clone()).collect())
    }
}

pub struct DuckBackend {
    conn: Connection,
    relations: HashSet<RelationHandle>,
}

impl DuckBackend {
    pub fn new() -> DuckResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Open a database file, or an in-memory database for `:memory:`
    pub fn open(database: &str) -> DuckResult<Self> {
        if database == ":memory:" {
            return Self::new();
        }
        Ok(Self::from_connection(Connection::open(Path::new(database))?))
    }

    /// [`DuckBackend::open`] with failures reported as a failed `open` operation
    pub fn connect(database: &str) -> Result<Self, BackendError> {
        Self::open(database).map_err(|e| BackendError::failed("open", e))
    }

    /// A fresh in-memory backend; fits `TestRunner` backend factories
    pub fn fresh() -> Result<Self, BackendError> {
        Self::connect(":memory:")
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            relations: HashSet::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Read back every row of a relation
    pub fn fetch(&self, handle: RelationHandle) -> Result<QueryResult, DuckError> {
        if !self.relations.contains(&handle) {
            return Err(DuckError::UnknownRelation(handle));
        }
        let columns = self.column_names(handle)?;
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM {}", table(handle)))?;
        let mut rows = stmt.query([])?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(convert(row.get_ref(i)?));
            }
            result.push(values);
        }
        Ok(QueryResult { columns, rows: result })
    }

    fn column_names(&self, handle: RelationHandle) -> DuckResult<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name FROM pragma_table_info({}) ORDER BY cid",
            quote_literal(&handle.to_string())
        ))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<DuckResult<Vec<String>>>()?;
        Ok(names)
    }

    fn source(&self, handle: RelationHandle) -> Result<String, BackendError> {
        if self.relations.contains(&handle) {
            Ok(table(handle))
        } else {
            Err(BackendError::UnknownRelation(handle))
        }
    }

    fn run(&self, operation: &'static str, sql: &str) -> Result<(), BackendError> {
        debug!(operation, sql, "Executing SQL");
        self.conn
            .execute_batch(sql)
            .map_err(|e| BackendError::failed(operation, e))
    }

    /// Materialize `query` as the relation `output`
    fn create(&mut self, operation: &'static str, output: RelationHandle, query: &str) -> Result<(), BackendError> {
        self.run(
            operation,
            &format!("CREATE OR REPLACE TEMP TABLE {} AS {}", table(output), query),
        )?;
        self.relations.insert(output);
        Ok(())
    }

    fn load_postgres(&mut self, pg: &PostgresConnection, output: RelationHandle) -> Result<(), BackendError> {
        self.run("load", "INSTALL postgres; LOAD postgres;")?;
        let dsn = postgres_dsn(pg);
        let sql = format!(
            "CREATE OR REPLACE TEMP TABLE {} AS SELECT * FROM postgres_scan({}, 'public', {})",
            table(output),
            quote_literal(&dsn),
            quote_literal(&pg.table)
        );
        // Statement carries the password; log the target only
        debug!(operation = "load", host = %pg.host, table = %pg.table, "Executing SQL");
        self.conn
            .execute_batch(&sql)
            .map_err(|e| BackendError::failed("load", e))?;
        self.relations.insert(output);
        Ok(())
    }
}

fn table(handle: RelationHandle) -> String {
    quote_ident(&handle.to_string())
}

fn convert(value: duckdb::types::ValueRef<'_>) -> Value {
    use duckdb::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i.into()),
        ValueRef::SmallInt(i) => Value::Int(i.into()),
        ValueRef::Int(i) => Value::Int(i.into()),
        ValueRef::BigInt(i) => Value::Int(i),
        ValueRef::HugeInt(i) => i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64)),
        ValueRef::UTinyInt(i) => Value::Int(i.into()),
        ValueRef::USmallInt(i) => Value::Int(i.into()),
        ValueRef::UInt(i) => Value::Int(i.into()),
        ValueRef::UBigInt(i) => i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64)),
        ValueRef::Float(f) => Value::Float(f.into()),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => Value::String(format!("{:?}", other)),
    }
}

impl TableBackend for DuckBackend {
    fn load(&mut self, source: &ResolvedSource, output: RelationHandle) -> Result<(), BackendError> {
        match source {
            ResolvedSource::File { path } => self.create(
                "load",
                output,
                &format!("SELECT * FROM read_csv_auto({})", quote_literal(path)),
            ),
            ResolvedSource::Parquet { path } => self.create(
                "load",
                output,
                &format!("SELECT * FROM read_parquet({})", quote_literal(path)),
            ),
            ResolvedSource::Postgres(pg) => self.load_postgres(pg, output),
        }
    }

    fn filter(&mut self, input: RelationHandle, predicate: &Expr, output: RelationHandle) -> Result<(), BackendError> {
        let src = self.source(input)?;
        self.create(
            "filter",
            output,
            &format!("SELECT * FROM {} WHERE {}", src, render_expr(predicate)),
        )
    }

    fn select(&mut self, input: RelationHandle, columns: &[String], output: RelationHandle) -> Result<(), BackendError> {
        let src = self.source(input)?;
        self.create(
            "select",
            output,
            &format!("SELECT {} FROM {}", column_list(columns), src),
        )
    }

    fn sort(
        &mut self,
        input: RelationHandle,
        by: &[String],
        ascending: bool,
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        let src = self.source(input)?;
        let direction = if ascending { "ASC" } else { "DESC" };
        let order = by
            .iter()
            .map(|c| format!("{} {}", quote_ident(c), direction))
            .collect::<Vec<_>>()
            .join(", ");
        self.create("sort", output, &format!("SELECT * FROM {} ORDER BY {}", src, order))
    }

    fn derive(
        &mut self,
        input: RelationHandle,
        columns: &[DerivedColumn],
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        let src = self.source(input)?;
        let existing = self
            .column_names(input)
            .map_err(|e| BackendError::failed("derive", e))?;

        let (replaced, added): (Vec<&DerivedColumn>, Vec<&DerivedColumn>) =
            columns.iter().partition(|c| existing.contains(&c.name));
        let render = |c: &&DerivedColumn| format!("{} AS {}", render_expr(&c.expr), quote_ident(&c.name));

        let mut projection = String::from("*");
        if !replaced.is_empty() {
            let replacements = replaced.iter().map(render).collect::<Vec<_>>().join(", ");
            projection.push_str(&format!(" REPLACE ({})", replacements));
        }
        for column in &added {
            projection.push_str(", ");
            projection.push_str(&render(column));
        }
        self.create("derive", output, &format!("SELECT {} FROM {}", projection, src))
    }

    fn group(&mut self, input: RelationHandle, by: &[String], output: RelationHandle) -> Result<(), BackendError> {
        let src = self.source(input)?;
        // Grouping is deferred to the aggregate; this only checks the keys
        self.run(
            "group",
            &format!(
                "CREATE OR REPLACE TEMP VIEW {} AS SELECT * FROM {}; SELECT {} FROM {} LIMIT 0",
                table(output),
                src,
                column_list(by),
                table(output)
            ),
        )?;
        self.relations.insert(output);
        Ok(())
    }

    fn group_aggregate(
        &mut self,
        input: RelationHandle,
        group_by: &[String],
        aggregations: &[Aggregation],
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        let src = self.source(input)?;
        let keys = column_list(group_by);
        let mut projection: Vec<String> = group_by.iter().map(|c| quote_ident(c)).collect();
        projection.extend(aggregations.iter().map(render_aggregation));

        let mut query = format!("SELECT {} FROM {}", projection.join(", "), src);
        if !group_by.is_empty() {
            query.push_str(&format!(" GROUP BY {}", keys));
        }
        self.create("group_aggregate", output, &query)
    }

    fn join(
        &mut self,
        left: RelationHandle,
        right: RelationHandle,
        left_on: &str,
        right_on: &str,
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        let (l, r) = (self.source(left)?, self.source(right)?);
        let failed = |e: duckdb::Error| BackendError::failed("join", e);
        let right_columns = self.column_names(right).map_err(failed)?;

        // Right columns replace same-named left columns
        let mut projection: Vec<String> = self
            .column_names(left)
            .map_err(failed)?
            .into_iter()
            .filter(|c| !right_columns.contains(c))
            .map(|c| format!("l.{}", quote_ident(&c)))
            .collect();
        projection.push("r.*".to_string());

        self.create(
            "join",
            output,
            &format!(
                "SELECT {} FROM {} AS l JOIN {} AS r ON l.{} = r.{}",
                projection.join(", "),
                l,
                r,
                quote_ident(left_on),
                quote_ident(right_on)
            ),
        )
    }

    fn persist(&mut self, input: RelationHandle, sink: &SinkSpec) -> Result<(), BackendError> {
        let src = self.source(input)?;
        let sql = match sink {
            SinkSpec::File { path } => format!("COPY {} TO {} (HEADER, DELIMITER ',')", src, quote_literal(path)),
            SinkSpec::Parquet { path } => format!("COPY {} TO {} (FORMAT PARQUET)", src, quote_literal(path)),
        };
        self.run("persist", &sql)
    }

    fn check(&mut self, input: RelationHandle, predicate: &Expr) -> Result<bool, BackendError> {
        let src = self.source(input)?;
        let sql = format!(
            "SELECT count(*) FROM {} WHERE NOT coalesce({}, FALSE)",
            src,
            render_expr(predicate)
        );
        debug!(operation = "check", sql = %sql, "Executing SQL");
        let violations: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| BackendError::failed("check", e))?;
        Ok(violations == 0)
    }
}
