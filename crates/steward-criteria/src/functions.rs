//! Named extension functions callable from expressions.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use steward_core::{json_type_name, Error, Result};

/// An extension function. Receives the document under evaluation and the
/// already-evaluated arguments.
pub type ExtensionFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// Function table handed to [`crate::Predicate::evaluate`].
#[derive(Clone)]
pub struct Functions {
    functions: HashMap<String, ExtensionFn>,
}

impl Default for Functions {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for Functions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Functions").field("names", &self.names()).finish()
    }
}

impl Functions {
    /// A table with no functions at all.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// `count`, `lower` and `exists`.
    pub fn with_builtins() -> Self {
        let mut functions = Self::empty();
        functions.register("count", |_, args| {
            let [value] = args else {
                return Err(Error::eval("count() takes exactly one argument"));
            };
            let len = match value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                Value::Null => 0,
                other => {
                    return Err(Error::eval(format!(
                        "count() of {}",
                        json_type_name(other)
                    )))
                }
            };
            Ok(Value::from(len))
        });
        functions.register("lower", |_, args| match args {
            [Value::String(s)] => Ok(Value::String(s.to_lowercase())),
            [other] => Err(Error::eval(format!("lower() of {}", json_type_name(other)))),
            _ => Err(Error::eval("lower() takes exactly one argument")),
        });
        functions.register("exists", |_, args| match args {
            [value] => Ok(Value::Bool(!value.is_null())),
            _ => Err(Error::eval("exists() takes exactly one argument")),
        });
        functions
    }

    /// Register a function. Replaces any existing function with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionFn> {
        self.functions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
