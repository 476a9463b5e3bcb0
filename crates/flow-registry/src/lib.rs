//! Schema and aggregate-function registries

use flow_ir::{AggFunc, Field, FieldType, Schema};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Schema '{0}' is already declared")]
    DuplicateSchema(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Aggregate function not found: {0}")]
    FunctionNotFound(String),

    #[error("Aggregate function {func} requires a column")]
    MissingColumn { func: String },
}

/// Named record schemas declared in source, plus compiler-derived shapes
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user schema; redeclaration is rejected.
    ///
    /// Field types are taken verbatim from the declaration.
    pub fn declare<I, N, T>(&mut self, name: &str, fields: I) -> Result<&Schema, RegistryError>
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        if self.schemas.contains_key(name) {
            return Err(RegistryError::DuplicateSchema(name.to_string()));
        }
        let schema = Schema::new(
            fields
                .into_iter()
                .map(|(n, t)| Field::new(n, FieldType::Known(t.into())))
                .collect(),
        );
        Ok(self.schemas.entry(name.to_string()).or_insert(schema))
    }

    /// Register a synthesized schema (join merge, aggregate shape). Overwrites.
    pub fn register_derived(&mut self, name: impl Into<String>, schema: Schema) {
        self.schemas.insert(name.into(), schema);
    }

    pub fn lookup(&self, name: &str) -> Result<&Schema, RegistryError> {
        self.schemas
            .get(name)
            .ok_or_else(|| RegistryError::SchemaNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub func: AggFunc,
    /// `count()` may omit its column; everything else needs one
    pub requires_column: bool,
}

pub struct FunctionRegistry {
    functions: HashMap<String, FunctionSignature>,
}

impl FunctionRegistry {
    /// A registry holding the builtin aggregates
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        for (name, func) in [
            ("count", AggFunc::Count),
            ("sum", AggFunc::Sum),
            ("avg", AggFunc::Avg),
            ("mean", AggFunc::Avg),
            ("min", AggFunc::Min),
            ("max", AggFunc::Max),
            ("median", AggFunc::Median),
        ] {
            self.register(FunctionSignature {
                name: name.to_string(),
                func,
                requires_column: func != AggFunc::Count,
            });
        }
    }

    pub fn register(&mut self, sig: FunctionSignature) {
        self.functions.insert(sig.name.clone(), sig);
    }

    pub fn lookup(&self, name: &str) -> Result<&FunctionSignature, RegistryError> {
        self.functions
            .get(name)
            .ok_or_else(|| RegistryError::FunctionNotFound(name.to_string()))
    }

    /// Resolve `name(column?)` to an aggregate, checking arity
    pub fn resolve(&self, name: &str, has_column: bool) -> Result<AggFunc, RegistryError> {
        let sig = self.lookup(name)?;
        if sig.requires_column && !has_column {
            return Err(RegistryError::MissingColumn {
                func: name.to_string(),
            });
        }
        Ok(sig.func)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
