//! Registry of tables, addressed by name.

use crate::schema::Schema;
use crate::table::Table;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use steward_core::{Entity, EntityId, Error, Result};
use steward_criteria::{compile, Functions, Predicate};
use tracing::info;

pub struct TypedStore {
    tables: DashMap<String, Arc<Table>>,
    functions: Functions,
}

impl Default for TypedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TypedStore {
    pub fn new() -> Self {
        Self::with_functions(Functions::default())
    }

    /// Store whose `query` expressions resolve calls through `functions`.
    pub fn with_functions(functions: Functions) -> Self {
        Self {
            tables: DashMap::new(),
            functions,
        }
    }

    /// Declare a table. Registering the same name twice is a validation error.
    pub fn register(&self, schema: Schema) -> Result<Arc<Table>> {
        match self.tables.entry(schema.table.clone()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "table '{}' already registered",
                schema.table
            ))),
            Entry::Vacant(slot) => {
                let table = Arc::new(Table::new(schema)?);
                info!(
                    "Registered table {} ({} columns)",
                    table.name(),
                    table.schema().columns().len()
                );
                slot.insert(table.clone());
                Ok(table)
            }
        }
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::not_found("table", name))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    pub fn insert(&self, table: &str, values: Entity) -> Result<Entity> {
        self.table(table)?.insert(values)
    }

    pub fn get_by_id(&self, table: &str, id: EntityId) -> Result<Entity> {
        self.table(table)?.get(id)
    }

    pub fn update(&self, table: &str, id: EntityId, partial: Entity) -> Result<Entity> {
        self.table(table)?.update(id, partial)
    }

    pub fn delete(&self, table: &str, id: EntityId) -> Result<Entity> {
        self.table(table)?.delete(id)
    }

    pub fn list(&self, table: &str) -> Result<Vec<Entity>> {
        Ok(self.table(table)?.list())
    }

    /// Rows of `table` matching `expression`. A malformed expression is a compile error.
    pub fn query(&self, table: &str, expression: &str) -> Result<Vec<Entity>> {
        let predicate = compile(expression)?;
        self.query_predicate(table, &predicate)
    }

    pub fn query_predicate(&self, table: &str, predicate: &Predicate) -> Result<Vec<Entity>> {
        Ok(self.table(table)?.query(predicate, &self.functions))
    }
}
