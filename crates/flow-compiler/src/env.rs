//! Binding environment: variable name → relation handle + schema name
//!
//! Generic over the handle type so the validator can track bindings
//! without allocating real handles.

use std::collections::HashMap;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding<H> {
    pub handle: H,
    pub schema: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BindingEnv<H> {
    bindings: HashMap<String, Binding<H>>,
}

impl<H: Copy> BindingEnv<H> {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Bind or rebind a variable
    pub fn bind(&mut self, name: impl Into<String>, handle: H, schema: Option<String>) {
        self.bindings.insert(name.into(), Binding { handle, schema });
    }

    pub fn resolve(&self, name: &str) -> Result<H, ValidationError> {
        self.binding(name).map(|b| b.handle)
    }

    pub fn binding(&self, name: &str) -> Result<&Binding<H>, ValidationError> {
        self.bindings
            .get(name)
            .ok_or_else(|| ValidationError::undefined_variable(name))
    }

    pub fn schema_of(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).and_then(|b| b.schema.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

impl<H: Copy> Default for BindingEnv<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Schema name a join result is bound to
pub fn join_schema_name(left: Option<&str>, right: Option<&str>) -> Option<String> {
    match (left, right) {
        (Some(l), Some(r)) => Some(format!("{}+{}", l, r)),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}
