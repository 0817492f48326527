//! Catalog of adventures and the per-node eligibility check.

use crate::graph::FactGraph;
use crate::schema;
use serde_json::Value;
use std::sync::Arc;
use steward_core::{Entity, EntityId, Error, Result};
use steward_criteria::{compile, Functions};
use steward_store::Table;
use tracing::{debug, info, warn};

/// Stored adventures. Each row carries a `name`, a `criteria` expression
/// over node views, and an opaque `dsl` plan.
pub struct AdventureCatalog {
    graph: Arc<FactGraph>,
    table: Arc<Table>,
}

impl AdventureCatalog {
    /// Register the adventures table alongside the graph's tables.
    pub fn new(graph: Arc<FactGraph>) -> Result<Self> {
        let table = graph.store().register(schema::adventures())?;
        Ok(Self { graph, table })
    }

    pub fn graph(&self) -> &Arc<FactGraph> {
        &self.graph
    }

    /// Criteria are stored as given; a malformed one only ever excludes its
    /// adventure from eligibility.
    pub fn create(&self, values: Entity) -> Result<Entity> {
        let adventure = self.table.insert(values)?;
        info!(
            "Created adventure {} ({})",
            adventure.id().unwrap_or_default(),
            adventure.get_str("name").unwrap_or_default()
        );
        Ok(adventure)
    }

    pub fn get(&self, id: EntityId) -> Result<Entity> {
        self.table.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Entity> {
        self.table
            .find(|row| row.get_str("name") == Some(name))
            .into_iter()
            .next()
    }

    pub fn update(&self, id: EntityId, partial: Entity) -> Result<Entity> {
        self.table.update(id, partial)
    }

    pub fn delete(&self, id: EntityId) -> Result<Entity> {
        self.table.delete(id)
    }

    pub fn list(&self) -> Vec<Entity> {
        self.table.list()
    }

    /// The plan stored on adventure `id`.
    pub fn dsl(&self, id: EntityId) -> Result<Value> {
        let adventure = self.get(id)?;
        match adventure.get("dsl") {
            Some(Value::Null) | None => Err(Error::validation(format!(
                "adventure {} has no dsl",
                id
            ))),
            Some(dsl) => Ok(dsl.clone()),
        }
    }

    /// Adventures whose criteria hold for node `node_id`.
    ///
    /// One adventure failing to compile or evaluate is logged and left out;
    /// it never hides the others.
    pub fn eligible_for(&self, node_id: EntityId) -> Result<Vec<Entity>> {
        let node = self.graph.get_node(node_id)?;
        let functions = self.graph.functions_for(Arc::new(self.graph.snapshot()));
        let document = node.to_document();

        let eligible = self.list().into_iter().fold(Vec::new(), |mut eligible, adventure| {
            match criteria_hold(&adventure, &document, &functions) {
                Ok(true) => eligible.push(adventure),
                Ok(false) => {}
                Err(e) => warn!(
                    "Excluding adventure {} ({}) for node {}: {}",
                    adventure.id().unwrap_or_default(),
                    adventure.get_str("name").unwrap_or_default(),
                    node_id,
                    e
                ),
            }
            eligible
        });

        debug!("Node {}: {} eligible adventures", node_id, eligible.len());
        Ok(eligible)
    }
}

fn criteria_hold(adventure: &Entity, document: &Value, functions: &Functions) -> Result<bool> {
    let criteria = adventure
        .get_str("criteria")
        .ok_or_else(|| Error::validation("adventure has no criteria"))?;
    compile(criteria)?.evaluate(document, functions)
}
