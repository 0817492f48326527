//! Column declarations and type coercion.

use serde_json::Value;
use steward_core::{json_type_name, Error, Result};

/// Semantic column type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    /// String with a maximum length in characters. Zero means unbounded.
    Text(usize),
    /// A single JSON value.
    StructuredEntry,
    /// An arbitrary JSON document.
    StructuredBlob,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Text(0) => write!(f, "text"),
            Self::Text(max) => write!(f, "text({})", max),
            Self::StructuredEntry => write!(f, "json entry"),
            Self::StructuredBlob => write!(f, "json"),
        }
    }
}

/// A value that could not be coerced to a column type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: String,
    pub found: String,
}

/// Coerce `value` to `ty`. Null passes through for every type.
pub fn coerce(ty: &ColumnType, value: Value) -> std::result::Result<Value, Mismatch> {
    let mismatch = |found: &Value| Mismatch {
        expected: ty.to_string(),
        found: describe(found),
    };

    match (ty, value) {
        (_, Value::Null) => Ok(Value::Null),

        (ColumnType::Integer, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                return Ok(Value::from(i));
            }
            if n.is_u64() {
                return Err(mismatch(&Value::Number(n)));
            }
            // i64::MAX as f64 rounds up to 2^63, which is already out of range.
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(mismatch(&Value::Number(n))),
            }
        }
        (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(Value::from(i)),
            Err(_) => Err(mismatch(&Value::String(s))),
        },
        (ColumnType::Integer, other) => Err(mismatch(&other)),

        (ColumnType::Text(max), value) => {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => return Err(mismatch(&other)),
            };
            if *max > 0 && text.chars().count() > *max {
                return Err(Mismatch {
                    expected: ty.to_string(),
                    found: format!("string of {} chars", text.chars().count()),
                });
            }
            Ok(Value::String(text))
        }

        (ColumnType::StructuredEntry, value) => Ok(value),

        // Clients that send a serialized document get it parsed.
        (ColumnType::StructuredBlob, Value::String(s)) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(&s) {
                    return Ok(parsed);
                }
            }
            Ok(Value::String(s))
        }
        (ColumnType::StructuredBlob, value) => Ok(value),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) if s.chars().count() <= 32 => format!("string {:?}", s),
        Value::Number(n) => format!("number {}", n),
        other => json_type_name(other).to_string(),
    }
}

/// A declared column. Flags default to `false`, except `updatable`.
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub primary_key: bool,
    pub unique: bool,
    pub updatable: bool,
    pub required: bool,
    pub read_only: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: false,
            unique: false,
            updatable: true,
            required: false,
            read_only: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Updates to this column are dropped instead of applied.
    pub fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn coerce(&self, value: Value) -> Result<Value> {
        coerce(&self.ty, value).map_err(|m| Error::type_mismatch(&self.name, m.expected, m.found))
    }
}

/// Statically declared table layout.
#[derive(Clone, Debug)]
pub struct Schema {
    pub table: String,
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Checks the declaration itself: one integer primary key, no duplicate names.
    pub fn validate(&self) -> Result<()> {
        let keys: Vec<&Column> = self.columns.iter().filter(|c| c.primary_key).collect();
        match keys.as_slice() {
            [pk] if pk.ty == ColumnType::Integer => {}
            [pk] => {
                return Err(Error::validation(format!(
                    "{}: primary key '{}' must be an integer",
                    self.table, pk.name
                )))
            }
            _ => {
                return Err(Error::validation(format!(
                    "{}: exactly one primary key column required",
                    self.table
                )))
            }
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::validation(format!(
                    "{}: duplicate column '{}'",
                    self.table, column.name
                )));
            }
        }
        Ok(())
    }
}
