//! In-memory table backend that records every call

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::HashMap;

use flow_ir::{
    AggFunc, Aggregation, BackendError, DerivedColumn, Expr, RelationHandle, ResolvedSource, SinkSpec,
    TableBackend, Value,
};

pub type Row = HashMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Relation {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect();
        Self { columns, rows }
    }

    pub fn column(&self, name: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// Data served by `load`, keyed by path (or table name for Postgres)
    pub fixtures: HashMap<String, Relation>,
    pub relations: HashMap<RelationHandle, Relation>,
    pub persisted: Vec<(SinkSpec, Relation)>,
    pub calls: Vec<String>,
    pub loaded: Vec<ResolvedSource>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture(mut self, key: &str, relation: Relation) -> Self {
        self.fixtures.insert(key.to_string(), relation);
        self
    }

    fn get(&self, handle: RelationHandle) -> Result<&Relation, BackendError> {
        self.relations
            .get(&handle)
            .ok_or(BackendError::UnknownRelation(handle))
    }

    fn put(&mut self, handle: RelationHandle, relation: Relation) {
        self.relations.insert(handle, relation);
    }
}

pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => as_f64(a).partial_cmp(&as_f64(b)).unwrap_or(Ordering::Equal),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

fn aggregate(func: AggFunc, values: Option<Vec<Value>>, rows: usize) -> Value {
    let Some(values) = values else {
        return Value::Int(rows as i64);
    };
    let present: Vec<Value> = values.into_iter().filter(|v| *v != Value::Null).collect();
    match func {
        AggFunc::Count => Value::Int(present.len() as i64),
        AggFunc::Sum => {
            if present.iter().all(|v| matches!(v, Value::Int(_))) {
                Value::Int(present.iter().map(|v| if let Value::Int(i) = v { *i } else { 0 }).sum())
            } else {
                Value::Float(present.iter().map(as_f64).sum())
            }
        }
        AggFunc::Avg => Value::Float(present.iter().map(as_f64).sum::<f64>() / present.len() as f64),
        AggFunc::Min => present.into_iter().min_by(compare).unwrap_or(Value::Null),
        AggFunc::Max => present.into_iter().max_by(compare).unwrap_or(Value::Null),
        AggFunc::Median => {
            let mut sorted: Vec<f64> = present.iter().map(as_f64).collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let n = sorted.len();
            if n == 0 {
                Value::Null
            } else if n % 2 == 1 {
                Value::Float(sorted[n / 2])
            } else {
                Value::Float((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
            }
        }
    }
}

impl TableBackend for MemoryBackend {
    fn load(&mut self, source: &ResolvedSource, output: RelationHandle) -> Result<(), BackendError> {
        self.calls.push(format!("load {}", output));
        let key = match source {
            ResolvedSource::File { path } | ResolvedSource::Parquet { path } => path.clone(),
            ResolvedSource::Postgres(pg) => pg.table.clone(),
        };
        let relation = self
            .fixtures
            .get(&key)
            .cloned()
            .ok_or_else(|| BackendError::failed("load", format!("no such file: {}", key)))?;
        self.loaded.push(source.clone());
        self.put(output, relation);
        Ok(())
    }

    fn filter(&mut self, input: RelationHandle, predicate: &Expr, output: RelationHandle) -> Result<(), BackendError> {
        self.calls.push(format!("filter {} -> {}", input, output));
        let relation = self.get(input)?;
        let mut rows = Vec::new();
        for row in &relation.rows {
            let keep = predicate.eval(row).map_err(|e| BackendError::failed("filter", e))?;
            if keep.is_true() {
                rows.push(row.clone());
            }
        }
        let filtered = Relation {
            columns: relation.columns.clone(),
            rows,
        };
        self.put(output, filtered);
        Ok(())
    }

    fn select(&mut self, input: RelationHandle, columns: &[String], output: RelationHandle) -> Result<(), BackendError> {
        self.calls.push(format!("select {} -> {}", input, output));
        let relation = self.get(input)?;
        for column in columns {
            if !relation.columns.contains(column) {
                return Err(BackendError::failed("select", format!("no column {}", column)));
            }
        }
        let rows = relation
            .rows
            .iter()
            .map(|row| columns.iter().map(|c| (c.clone(), row[c].clone())).collect())
            .collect();
        self.put(
            output,
            Relation {
                columns: columns.to_vec(),
                rows,
            },
        );
        Ok(())
    }

    fn sort(
        &mut self,
        input: RelationHandle,
        by: &[String],
        ascending: bool,
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        self.calls.push(format!("sort {} -> {}", input, output));
        let mut relation = self.get(input)?.clone();
        relation.rows.sort_by(|a, b| {
            let ordering = by
                .iter()
                .map(|c| compare(&a[c], &b[c]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        self.put(output, relation);
        Ok(())
    }

    fn derive(
        &mut self,
        input: RelationHandle,
        columns: &[DerivedColumn],
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        self.calls.push(format!("derive {} -> {}", input, output));
        let relation = self.get(input)?;
        let mut derived = relation.clone();
        for (source, target) in relation.rows.iter().zip(derived.rows.iter_mut()) {
            for column in columns {
                let value = column.expr.eval(source).map_err(|e| BackendError::failed("derive", e))?;
                target.insert(column.name.clone(), value);
            }
        }
        for column in columns {
            if !derived.columns.contains(&column.name) {
                derived.columns.push(column.name.clone());
            }
        }
        self.put(output, derived);
        Ok(())
    }

    fn group(&mut self, input: RelationHandle, by: &[String], output: RelationHandle) -> Result<(), BackendError> {
        self.calls.push(format!("group {} -> {}", input, output));
        let relation = self.get(input)?.clone();
        for column in by {
            if !relation.columns.contains(column) {
                return Err(BackendError::failed("group", format!("no column {}", column)));
            }
        }
        self.put(output, relation);
        Ok(())
    }

    fn group_aggregate(
        &mut self,
        input: RelationHandle,
        group_by: &[String],
        aggregations: &[Aggregation],
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        self.calls.push(format!("group_aggregate {} -> {}", input, output));
        let relation = self.get(input)?;

        let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();
        for row in &relation.rows {
            let key: Vec<Value> = group_by.iter().map(|c| row[c].clone()).collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }

        let mut columns = group_by.to_vec();
        columns.extend(aggregations.iter().map(|a| a.name.clone()));
        let rows = groups
            .into_iter()
            .map(|(key, members)| {
                let mut out: Row = group_by.iter().cloned().zip(key).collect();
                for agg in aggregations {
                    let values = agg
                        .column
                        .as_ref()
                        .map(|c| members.iter().map(|r| r[c].clone()).collect());
                    out.insert(agg.name.clone(), aggregate(agg.func, values, members.len()));
                }
                out
            })
            .collect();
        self.put(output, Relation { columns, rows });
        Ok(())
    }

    fn join(
        &mut self,
        left: RelationHandle,
        right: RelationHandle,
        left_on: &str,
        right_on: &str,
        output: RelationHandle,
    ) -> Result<(), BackendError> {
        self.calls.push(format!("join {} {} -> {}", left, right, output));
        let (l, r) = (self.get(left)?, self.get(right)?);
        let mut columns: Vec<String> = l.columns.iter().filter(|c| !r.columns.contains(c)).cloned().collect();
        columns.extend(r.columns.iter().cloned());

        let mut rows = Vec::new();
        for lrow in &l.rows {
            for rrow in &r.rows {
                if lrow[left_on] == rrow[right_on] && lrow[left_on] != Value::Null {
                    let mut joined = lrow.clone();
                    joined.extend(rrow.iter().map(|(k, v)| (k.clone(), v.clone())));
                    rows.push(joined);
                }
            }
        }
        self.put(output, Relation { columns, rows });
        Ok(())
    }

    fn persist(&mut self, input: RelationHandle, sink: &SinkSpec) -> Result<(), BackendError> {
        self.calls.push(format!("persist {}", input));
        let relation = self.get(input)?.clone();
        self.persisted.push((sink.clone(), relation));
        Ok(())
    }

    fn check(&mut self, input: RelationHandle, predicate: &Expr) -> Result<bool, BackendError> {
        self.calls.push(format!("check {}", input));
        let relation = self.get(input)?;
        for row in &relation.rows {
            if !predicate.eval(row).map_err(|e| BackendError::failed("check", e))?.is_true() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub fn int(i: i64) -> Value {
    Value::Int(i)
}

pub fn float(f: f64) -> Value {
    Value::Float(f)
}

pub fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

/// orders(id, customer, amount)
pub fn orders() -> Relation {
    Relation::new(
        &["id", "customer", "amount"],
        vec![
            vec![int(1), text("ada"), float(120.0)],
            vec![int(2), text("bob"), float(80.0)],
            vec![int(3), text("ada"), float(300.0)],
            vec![int(4), text("cy"), float(50.0)],
        ],
    )
}

/// customers(customer, city)
pub fn customers() -> Relation {
    Relation::new(
        &["customer", "city"],
        vec![
            vec![text("ada"), text("London")],
            vec![text("bob"), text("Paris")],
        ],
    )
}

pub fn shop_backend() -> MemoryBackend {
    MemoryBackend::new()
        .with_fixture("orders.csv", orders())
        .with_fixture("customers.csv", customers())
}
