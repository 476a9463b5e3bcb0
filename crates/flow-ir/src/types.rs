//! Type system for Flow IR

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of one schema field
///
/// The compiler does no arithmetic type inference, so columns introduced by
/// `mutate` are `Unresolved` and columns introduced by `aggregate` are
/// `Aggregate`. Only declared fields carry a `Known` type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Known(String),
    Unresolved,
    Aggregate,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Known(name) => f.write_str(name),
            FieldType::Unresolved => f.write_str("<unresolved>"),
            FieldType::Aggregate => f.write_str("<aggregate>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered field name → type mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        let mut schema = Self::default();
        for field in fields {
            schema.upsert(field.name, field.field_type);
        }
        schema
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find_field(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Insert a field, replacing the type in place if the name exists
    pub fn upsert(&mut self, name: impl Into<String>, field_type: FieldType) {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.field_type = field_type,
            None => self.fields.push(Field { name, field_type }),
        }
    }

    /// Merge where `other` wins on name collisions
    pub fn merged_with(&self, other: &Schema) -> Schema {
        let mut merged = self.clone();
        for field in &other.fields {
            merged.upsert(field.name.clone(), field.field_type.clone());
        }
        merged
    }
}

/// Aggregate functions understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Median,
}

impl AggFunc {
    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Median => "median",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
