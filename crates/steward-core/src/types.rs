//! Core types for Steward

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Store-assigned primary key.
pub type EntityId = i64;

/// Fact key holding the parent node's id.
pub const PARENT_ID_FACT: &str = "parent_id";
/// Fact key holding the node's role set.
pub const BACKENDS_FACT: &str = "backends";
/// Role marking a node as a grouping parent.
pub const CONTAINER_ROLE: &str = "container";

/// Wait-condition key for tasks targeting `node_id`.
pub fn task_key(node_id: EntityId) -> String {
    format!("task-for-{}", node_id)
}

/// A stored row: column name to value. Undeclared columns pass through verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build from a JSON object. Anything else is a validation error.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::validation(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        self.get_i64("id")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for Entity {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Short type label used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Task lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Delivered,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Delivered,
        TaskState::Running,
        TaskState::Done,
        TaskState::Error,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the task state machine.
    /// Staying in the same state is not a transition and is always allowed.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::Delivered => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Done | Self::Error | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown task state '{}'", s)))
    }
}

/// Bind mode for the HTTP boundary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}
