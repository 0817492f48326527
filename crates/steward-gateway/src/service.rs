//! The boundary operations the routing layer calls.
//!
//! Owns one instance of every core component, wired the way the running
//! service needs them: one store, one coordinator, one ledger.

use serde_json::{json, Value};
use std::sync::Arc;
use steward_core::{
    Clock, Entity, EntityId, Error, Result, StewardConfig, SystemClock,
};
use steward_dispatch::{
    AdventureRunner, DispatchCoordinator, PlanOnlySolver, RunOutcome, Solver, Task, TaskLedger,
};
use steward_fleet::{AdventureCatalog, FactGraph, NodeView, TreeNode};
use steward_store::TypedStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct StewardService {
    config: StewardConfig,
    store: Arc<TypedStore>,
    graph: Arc<FactGraph>,
    catalog: Arc<AdventureCatalog>,
    coordinator: Arc<DispatchCoordinator>,
    ledger: Arc<TaskLedger>,
    runner: AdventureRunner,
    shutdown: CancellationToken,
    started_at: std::time::Instant,
}

impl StewardService {
    pub fn new(config: StewardConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(PlanOnlySolver), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: StewardConfig,
        solver: Arc<dyn Solver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(TypedStore::new());
        let coordinator = Arc::new(DispatchCoordinator::new());
        let graph = Arc::new(FactGraph::new(store.clone())?);
        let catalog = Arc::new(AdventureCatalog::new(graph.clone())?);
        let ledger = Arc::new(TaskLedger::with_clock(
            &store,
            coordinator.clone(),
            &config.tasks,
            clock,
        )?);
        let runner = AdventureRunner::new(
            catalog.clone(),
            ledger.clone(),
            solver,
            config.dispatch.adventurator_capability.clone(),
        );
        info!("Tables: {:?}", store.table_names());

        Ok(Self {
            config,
            store,
            graph,
            catalog,
            coordinator,
            ledger,
            runner,
            shutdown: CancellationToken::new(),
            started_at: std::time::Instant::now(),
        })
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<FactGraph> {
        &self.graph
    }

    pub fn catalog(&self) -> &Arc<AdventureCatalog> {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn runner(&self) -> &AdventureRunner {
        &self.runner
    }

    /// Cancelled on shutdown so blocked polls return promptly.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // -- tasks --

    /// Create a task. Its `node_id` must name an existing node.
    pub fn create_task(&self, values: Entity) -> Result<Task> {
        self.check_task_target(&values)?;
        self.ledger.create(values)
    }

    /// Apply a non-empty partial update. A new `node_id` must name an
    /// existing node.
    pub fn update_task(&self, id: EntityId, partial: Entity) -> Result<Task> {
        if partial.as_map().is_empty() {
            return Err(Error::validation("no fields to update"));
        }
        self.check_task_target(&partial)?;
        self.ledger.update(id, partial)
    }

    fn check_task_target(&self, values: &Entity) -> Result<()> {
        if let Some(node_id) = values.get("node_id").and_then(as_id) {
            if self.graph.get_node(node_id).is_err() {
                return Err(Error::validation(format!(
                    "node_id {} does not name a node",
                    node_id
                )));
            }
        }
        Ok(())
    }

    /// Hand the next pending task to `node_id`, marking it delivered.
    pub fn pending_task_for_node(&self, node_id: EntityId) -> Result<Task> {
        self.graph.get_node(node_id)?;
        self.ledger
            .deliver_next(node_id)?
            .ok_or_else(|| Error::not_found("pending task for node", node_id))
    }

    /// Block until a task is delivered to `node_id`, the configured poll
    /// timeout passes, or the service shuts down.
    pub async fn long_poll_pending_task(&self, node_id: EntityId) -> Result<Option<Task>> {
        self.graph.get_node(node_id)?;
        self.ledger
            .long_poll_deliver(
                node_id,
                self.config.dispatch.long_poll_timeout(),
                &self.shutdown,
            )
            .await
    }

    // -- nodes --

    pub fn node_tree(&self, node_id: EntityId) -> Result<TreeNode> {
        self.graph.build_tree(node_id)
    }

    pub fn eligible_adventures(&self, node_id: EntityId) -> Result<Vec<Entity>> {
        self.catalog.eligible_for(node_id)
    }

    pub fn register_or_get(&self, hostname: &str) -> Result<NodeView> {
        self.graph.register_or_get(hostname)
    }

    // -- adventures --

    pub fn execute_adventure(&self, adventure_id: EntityId, nodes: &[EntityId]) -> Result<Task> {
        self.runner.run_defined_adventure(adventure_id, nodes)
    }

    pub async fn solve(
        &self,
        node_id: EntityId,
        constraints: &[String],
        plan: Option<Value>,
    ) -> Result<RunOutcome> {
        self.runner.solve_and_run(node_id, constraints, plan).await
    }

    pub fn health(&self) -> Value {
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "tables": self.store.table_names(),
            "nodes": self.graph.list_nodes().len(),
            "tasks": self.ledger.list().len(),
            "wait_keys": self.coordinator.registered_keys().len(),
        })
    }
}

fn as_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
