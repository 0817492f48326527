//! Nodes and their facts.
//!
//! A node is a named row; everything else known about it lives in the facts
//! table as `(node_id, key, value)` triples, at most one per key. Callers see
//! the two joined as a [`NodeView`], with facts folded in under `facts`.

use crate::schema;
use dashmap::DashMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use steward_core::{
    json_type_name, Entity, EntityId, Error, Result, BACKENDS_FACT, CONTAINER_ROLE,
    PARENT_ID_FACT,
};
use steward_criteria::{compile, Functions, Predicate};
use steward_store::{Column, ColumnType, Table, TypedStore};
use tracing::{debug, info, warn};

/// A node row joined with its facts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeView {
    pub node: Entity,
    pub facts: Map<String, Value>,
}

impl NodeView {
    pub fn id(&self) -> EntityId {
        self.node.id().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.node.get_str("name").unwrap_or_default()
    }

    pub fn fact(&self, key: &str) -> Option<&Value> {
        self.facts.get(key)
    }

    pub fn parent_id(&self) -> Option<EntityId> {
        self.facts.get(PARENT_ID_FACT).and_then(Value::as_i64)
    }

    pub fn backends(&self) -> Vec<&str> {
        match self.facts.get(BACKENDS_FACT) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_backend(&self, backend: &str) -> bool {
        self.backends().contains(&backend)
    }

    pub fn is_container(&self) -> bool {
        self.has_backend(CONTAINER_ROLE)
    }

    /// The document expressions are evaluated against.
    pub fn to_document(&self) -> Value {
        let mut doc = self.node.as_map().clone();
        doc.insert("facts".to_string(), Value::Object(self.facts.clone()));
        Value::Object(doc)
    }
}

impl Serialize for NodeView {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

/// Point-in-time copy of every node view plus the parent/child index.
///
/// Hierarchy walks run against a snapshot so they never hold table locks
/// and see one consistent picture even while writers are active.
#[derive(Clone, Debug, Default)]
pub struct GraphSnapshot {
    views: HashMap<EntityId, NodeView>,
    order: Vec<EntityId>,
    children: HashMap<EntityId, Vec<EntityId>>,
}

impl GraphSnapshot {
    fn build(nodes: Vec<Entity>, facts: Vec<Entity>) -> Self {
        let mut views: HashMap<EntityId, NodeView> = HashMap::with_capacity(nodes.len());
        let mut order = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(id) = node.id() else { continue };
            order.push(id);
            views.insert(
                id,
                NodeView {
                    node,
                    facts: Map::new(),
                },
            );
        }

        for fact in facts {
            let (Some(node_id), Some(key)) = (fact.get_i64("node_id"), fact.get_str("key")) else {
                continue;
            };
            if let Some(view) = views.get_mut(&node_id) {
                let value = fact.get("value").cloned().unwrap_or(Value::Null);
                view.facts.insert(key.to_string(), value);
            }
        }

        let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        for id in &order {
            if let Some(parent) = views.get(id).and_then(NodeView::parent_id) {
                children.entry(parent).or_default().push(*id);
            }
        }

        Self {
            views,
            order,
            children,
        }
    }

    pub fn node(&self, id: EntityId) -> Option<&NodeView> {
        self.views.get(&id)
    }

    /// Every node, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeView> {
        self.order.iter().filter_map(|id| self.views.get(id))
    }

    pub fn children_of(&self, id: EntityId) -> &[EntityId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&NodeView> {
        self.nodes().find(|view| view.name() == name)
    }

    /// Whether some ancestor of `id` is named `name`. Stops at the first repeat.
    pub fn has_ancestor(&self, id: EntityId, name: &str) -> bool {
        let mut seen = HashSet::from([id]);
        let mut cursor = self.node(id).and_then(NodeView::parent_id);
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                return false;
            }
            let Some(parent) = self.node(parent_id) else {
                return false;
            };
            if parent.name() == name {
                return true;
            }
            cursor = parent.parent_id();
        }
        false
    }
}

pub struct FactGraph {
    store: Arc<TypedStore>,
    nodes: Arc<Table>,
    facts: Arc<Table>,
    /// Serializes fact writes per node so each `(node, key)` holds one row.
    writers: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl FactGraph {
    /// Register the node and fact tables in `store`.
    pub fn new(store: Arc<TypedStore>) -> Result<Self> {
        let nodes = store.register(schema::nodes())?;
        let facts = store.register(schema::facts())?;
        Ok(Self {
            store,
            nodes,
            facts,
            writers: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<TypedStore> {
        &self.store
    }

    // -- nodes --

    /// Create a node. An optional `facts` object is validated up front and
    /// written after the row exists; if any fact fails the node is removed
    /// again.
    pub fn create_node(&self, mut values: Entity) -> Result<NodeView> {
        let facts = take_facts(&mut values)?;
        let facts = self.normalize_facts(None, facts)?;
        let row = self.nodes.insert(values)?;
        let id = row.id().ok_or_else(|| Error::Internal("node without id".into()))?;
        for (key, value) in facts {
            if let Err(e) = self.write_fact(id, &key, value) {
                warn!("Node {}: fact {} rejected, rolling back: {}", id, key, e);
                if let Err(cleanup) = self.delete_node(id) {
                    warn!("Node {}: rollback failed: {}", id, cleanup);
                }
                return Err(e);
            }
        }
        info!("Created node {} ({})", id, row.get_str("name").unwrap_or_default());
        self.get_node(id)
    }

    pub fn get_node(&self, id: EntityId) -> Result<NodeView> {
        let node = self.nodes.get(id)?;
        let facts = self
            .facts_for(id)
            .into_iter()
            .filter_map(|fact| {
                let key = fact.get_str("key")?.to_string();
                Some((key, fact.get("value").cloned().unwrap_or(Value::Null)))
            })
            .collect();
        Ok(NodeView { node, facts })
    }

    /// Update node attributes. A `facts` object is applied key by key.
    pub fn update_node(&self, id: EntityId, mut partial: Entity) -> Result<NodeView> {
        let facts = take_facts(&mut partial)?;
        let facts = self.normalize_facts(Some(id), facts)?;
        if !partial.as_map().is_empty() {
            self.nodes.update(id, partial)?;
        } else {
            self.nodes.get(id)?;
        }
        for (key, value) in facts {
            self.write_fact(id, &key, value)?;
        }
        self.get_node(id)
    }

    /// Delete a node together with its facts. Children keep their dangling
    /// `parent_id` and fall out of every tree.
    pub fn delete_node(&self, id: EntityId) -> Result<NodeView> {
        let writer = self.writer(id);
        let guard = writer
            .lock()
            .map_err(|_| Error::Internal(format!("fact lock for node {} poisoned", id)))?;

        let view = self.get_node(id)?;
        self.nodes.delete(id)?;
        let mut removed = 0;
        for fact in self.facts_for(id) {
            let Some(fact_id) = fact.id() else { continue };
            match self.facts.delete(fact_id) {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        drop(guard);
        self.writers.remove(&id);
        info!("Deleted node {} ({}) and {} facts", id, view.name(), removed);
        Ok(view)
    }

    pub fn list_nodes(&self) -> Vec<NodeView> {
        self.snapshot().nodes().cloned().collect()
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<NodeView> {
        let row = self
            .nodes
            .find(|row| row.get_str("name") == Some(name))
            .into_iter()
            .next()?;
        self.get_node(row.id()?).ok()
    }

    /// Node views matching `expression`. Facts are addressable as `facts.<key>`.
    pub fn query_nodes(&self, expression: &str) -> Result<Vec<NodeView>> {
        let predicate = compile(expression)?;
        Ok(self.query_nodes_with(&predicate))
    }

    pub fn query_nodes_with(&self, predicate: &Predicate) -> Vec<NodeView> {
        let snapshot = Arc::new(self.snapshot());
        let functions = self.functions_for(snapshot.clone());
        snapshot
            .nodes()
            .filter(|view| match predicate.evaluate(&view.to_document(), &functions) {
                Ok(matched) => matched,
                Err(e) => {
                    debug!("'{}' skipped node {}: {}", predicate.source(), view.id(), e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    pub fn children(&self, id: EntityId) -> Result<Vec<NodeView>> {
        self.nodes.get(id)?;
        let snapshot = self.snapshot();
        Ok(snapshot
            .children_of(id)
            .iter()
            .filter_map(|child| snapshot.node(*child).cloned())
            .collect())
    }

    pub fn is_container(&self, id: EntityId) -> Result<bool> {
        Ok(self.get_node(id)?.is_container())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot::build(self.nodes.list(), self.facts.list())
    }

    /// The store's functions plus `childof(name)`, resolved against `snapshot`.
    pub fn functions_for(&self, snapshot: Arc<GraphSnapshot>) -> Functions {
        let mut functions = self.store.functions().clone();
        functions.register("childof", move |doc, args| {
            let [Value::String(name)] = args else {
                return Err(Error::eval("childof() takes one string argument"));
            };
            let Some(id) = doc.get("id").and_then(Value::as_i64) else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(snapshot.has_ancestor(id, name)))
        });
        functions
    }

    // -- facts --

    pub fn get_fact(&self, id: EntityId) -> Result<Entity> {
        self.facts.get(id)
    }

    pub fn list_facts(&self) -> Vec<Entity> {
        self.facts.list()
    }

    pub fn facts_for(&self, node_id: EntityId) -> Vec<Entity> {
        self.facts.find(|fact| fact.get_i64("node_id") == Some(node_id))
    }

    pub fn fact_value(&self, node_id: EntityId, key: &str) -> Option<Value> {
        self.find_fact(node_id, key)
            .and_then(|fact| fact.get("value").cloned())
    }

    /// Create a fact from a raw row. An existing `(node_id, key)` is overwritten.
    pub fn create_fact(&self, values: Entity) -> Result<Entity> {
        let node_id = match values.get("node_id") {
            Some(value) => Column::new("node_id", ColumnType::Integer)
                .coerce(value.clone())?
                .as_i64()
                .ok_or_else(|| Error::validation("facts: 'node_id' is required"))?,
            None => return Err(Error::validation("facts: 'node_id' is required")),
        };
        let key = match values.get("key") {
            Some(Value::String(key)) => key.clone(),
            Some(other) => {
                return Err(Error::type_mismatch("key", "text", json_type_name(other)))
            }
            None => return Err(Error::validation("facts: 'key' is required")),
        };
        let value = values.get("value").cloned().unwrap_or(Value::Null);
        self.set_fact(node_id, &key, value)
    }

    /// Upsert the fact `key` on `node_id`.
    pub fn set_fact(&self, node_id: EntityId, key: &str, value: Value) -> Result<Entity> {
        let value = self.normalize_fact(Some(node_id), key, value)?;
        self.write_fact(node_id, key, value)
    }

    /// Only `value` may change; `node_id` and `key` may be repeated unchanged.
    pub fn update_fact(&self, id: EntityId, mut partial: Entity) -> Result<Entity> {
        let current = self.facts.get(id)?;
        let node_id = current
            .get_i64("node_id")
            .ok_or_else(|| Error::Internal(format!("fact {} has no node", id)))?;
        let key = current.get_str("key").unwrap_or_default().to_string();

        if let Some(requested) = partial.remove("node_id") {
            let requested = Column::new("node_id", ColumnType::Integer).coerce(requested)?;
            if requested.as_i64() != Some(node_id) {
                return Err(Error::validation("facts: 'node_id' cannot be changed"));
            }
        }
        if let Some(requested) = partial.remove("key") {
            if requested.as_str() != Some(key.as_str()) {
                return Err(Error::validation("facts: 'key' cannot be changed"));
            }
        }
        if let Some(value) = partial.remove("value") {
            partial.insert("value", self.normalize_fact(Some(node_id), &key, value)?);
        }

        let writer = self.writer(node_id);
        let _guard = writer
            .lock()
            .map_err(|_| Error::Internal(format!("fact lock for node {} poisoned", node_id)))?;
        self.facts.update(id, partial)
    }

    pub fn delete_fact(&self, id: EntityId) -> Result<Entity> {
        self.facts.delete(id)
    }

    fn find_fact(&self, node_id: EntityId, key: &str) -> Option<Entity> {
        self.facts
            .find(|fact| fact.get_i64("node_id") == Some(node_id) && fact.get_str("key") == Some(key))
            .into_iter()
            .next()
    }

    /// Write an already-normalized value under the node's writer lock.
    fn write_fact(&self, node_id: EntityId, key: &str, value: Value) -> Result<Entity> {
        let writer = self.writer(node_id);
        let _guard = writer
            .lock()
            .map_err(|_| Error::Internal(format!("fact lock for node {} poisoned", node_id)))?;

        // Checked under the lock so a concurrent delete cannot leave an orphan.
        self.nodes.get(node_id)?;

        match self.find_fact(node_id, key).and_then(|fact| fact.id()) {
            Some(fact_id) => {
                let mut partial = Entity::new();
                partial.insert("value", value);
                let fact = self.facts.update(fact_id, partial)?;
                debug!("Node {}: fact {} updated", node_id, key);
                Ok(fact)
            }
            None => {
                let mut row = Entity::new();
                row.insert("node_id", Value::from(node_id));
                row.insert("key", Value::String(key.to_string()));
                row.insert("value", value);
                let fact = self.facts.insert(row)?;
                debug!("Node {}: fact {} set", node_id, key);
                Ok(fact)
            }
        }
    }

    fn writer(&self, node_id: EntityId) -> Arc<Mutex<()>> {
        self.writers
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn normalize_facts(
        &self,
        node_id: Option<EntityId>,
        facts: Map<String, Value>,
    ) -> Result<Vec<(String, Value)>> {
        facts
            .into_iter()
            .map(|(key, value)| {
                let value = self.normalize_fact(node_id, &key, value)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Validate the reserved fact keys.
    ///
    /// Every fact needs a non-null value. `parent_id` must name another
    /// existing node; `backends` must be a list of strings and is
    /// de-duplicated. Other keys take any value.
    fn normalize_fact(&self, node_id: Option<EntityId>, key: &str, value: Value) -> Result<Value> {
        if key.is_empty() {
            return Err(Error::validation("facts: 'key' must not be empty"));
        }
        if value.is_null() {
            return Err(Error::validation(format!("facts: '{}' needs a value", key)));
        }
        match key {
            PARENT_ID_FACT => {
                let value = Column::new(PARENT_ID_FACT, ColumnType::Integer).coerce(value)?;
                if let Some(parent) = value.as_i64() {
                    if Some(parent) == node_id {
                        return Err(Error::validation("a node cannot be its own parent"));
                    }
                    if self.nodes.get(parent).is_err() {
                        return Err(Error::validation(format!(
                            "parent_id {} does not name a node",
                            parent
                        )));
                    }
                }
                Ok(value)
            }
            BACKENDS_FACT => {
                let Value::Array(items) = value else {
                    return Err(Error::type_mismatch(
                        BACKENDS_FACT,
                        "array of strings",
                        json_type_name(&value),
                    ));
                };
                let mut seen = HashSet::new();
                let mut backends = Vec::with_capacity(items.len());
                for item in items {
                    let Value::String(backend) = item else {
                        return Err(Error::type_mismatch(
                            BACKENDS_FACT,
                            "array of strings",
                            format!("array containing {}", json_type_name(&item)),
                        ));
                    };
                    if seen.insert(backend.clone()) {
                        backends.push(Value::String(backend));
                    }
                }
                Ok(Value::Array(backends))
            }
            _ => Ok(value),
        }
    }
}

fn take_facts(values: &mut Entity) -> Result<Map<String, Value>> {
    match values.remove("facts") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(facts)) => Ok(facts),
        Some(other) => Err(Error::type_mismatch("facts", "object", json_type_name(&other))),
    }
}
