//! Agent self-registration.

use crate::graph::{FactGraph, NodeView};
use serde_json::{json, Value};
use steward_core::{Entity, Error, Result, BACKENDS_FACT, CONTAINER_ROLE, PARENT_ID_FACT};
use tracing::{debug, info};

/// Name of the container newly registered agents are parked under.
pub const UNPROVISIONED: &str = "unprovisioned";

impl FactGraph {
    /// Look up the node named `hostname`, creating it if absent.
    ///
    /// A new node is an agent parked under the unprovisioned container.
    /// Concurrent calls for the same hostname resolve to a single node.
    pub fn register_or_get(&self, hostname: &str) -> Result<NodeView> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(Error::validation("hostname must not be empty"));
        }
        if let Some(node) = self.find_node_by_name(hostname) {
            debug!("whoami: {} is node {}", hostname, node.id());
            return Ok(node);
        }

        let parent = self.unprovisioned_container()?;
        let mut values = Entity::new();
        values.insert("name", Value::String(hostname.to_string()));
        values.insert(
            "facts",
            json!({
                BACKENDS_FACT: ["node", "agent"],
                PARENT_ID_FACT: parent.id(),
            }),
        );

        match self.create_node(values) {
            Ok(node) => {
                info!("Registered agent {} as node {}", hostname, node.id());
                Ok(node)
            }
            Err(e) => self.lost_race(hostname, e),
        }
    }

    /// The container holding unprovisioned agents, created on first use.
    pub fn unprovisioned_container(&self) -> Result<NodeView> {
        let node = match self.find_node_by_name(UNPROVISIONED) {
            Some(node) => node,
            None => {
                let mut values = Entity::new();
                values.insert("name", Value::String(UNPROVISIONED.to_string()));
                values.insert("facts", json!({ BACKENDS_FACT: ["node", CONTAINER_ROLE] }));
                match self.create_node(values) {
                    Ok(node) => node,
                    Err(e) => self.lost_race(UNPROVISIONED, e)?,
                }
            }
        };
        if node.is_container() {
            return Ok(node);
        }

        let mut backends: Vec<Value> = node
            .backends()
            .into_iter()
            .map(|b| Value::String(b.to_string()))
            .collect();
        backends.push(Value::String(CONTAINER_ROLE.to_string()));
        self.set_fact(node.id(), BACKENDS_FACT, Value::Array(backends))?;
        self.get_node(node.id())
    }

    /// A failed insert for `name` is fine if another writer created it first.
    fn lost_race(&self, name: &str, error: Error) -> Result<NodeView> {
        match (&error, self.find_node_by_name(name)) {
            (Error::Validation(_), Some(node)) => {
                debug!("{} registered concurrently as node {}", name, node.id());
                Ok(node)
            }
            _ => Err(error),
        }
    }
}
