use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::value::{escape_xml, to_text, type_name};

/// A function callable from templates.
pub type Builtin = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Bindings visible to every template compiled under one context.
///
/// Built once and never mutated afterwards: the same context evaluates many
/// templates, possibly interleaved.
#[derive(Clone)]
pub struct SharedEnv {
    values: Map<String, Value>,
    functions: HashMap<String, Builtin>,
}

impl Default for SharedEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("SharedEnv")
            .field("values", &self.values)
            .field("functions", &names)
            .finish()
    }
}

impl SharedEnv {
    /// An environment with the standard functions.
    pub fn new() -> Self {
        let mut env = Self::empty();
        env.add_function("escape", |args| Ok(Value::String(escape_xml(&to_text(arg(args, 0))))));
        env.add_function("json", |args| {
            serde_json::to_string(arg(args, 0))
                .map(Value::String)
                .map_err(|e| e.to_string())
        });
        env.add_function("len", |args| match arg(args, 0) {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(format!("len() of {}", type_name(other))),
        });
        env.add_function("keys", |args| match arg(args, 0) {
            Value::Object(map) => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            other => Err(format!("keys() of {}", type_name(other))),
        });
        env.add_function("join", |args| match arg(args, 0) {
            Value::Array(items) => {
                let sep = match args.get(1) {
                    Some(v) => to_text(v),
                    None => ",".to_string(),
                };
                Ok(Value::String(
                    items.iter().map(to_text).collect::<Vec<_>>().join(&sep),
                ))
            }
            other => Err(format!("join() of {}", type_name(other))),
        });
        env
    }

    /// An environment without any functions.
    pub fn empty() -> Self {
        Self {
            values: Map::new(),
            functions: HashMap::new(),
        }
    }

    pub fn add_function<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn add_value<T: Serialize>(
        &mut self,
        name: &str,
        value: &T,
    ) -> Result<&mut Self, serde_json::Error> {
        self.values.insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Builtin> {
        self.functions.get(name)
    }
}

fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&Value::Null)
}
