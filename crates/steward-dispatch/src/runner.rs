//! Adventure execution: turning a plan into an `adventurate` task.

use crate::ledger::{Task, TaskLedger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use steward_core::{EntityId, Error, Result};
use steward_fleet::{AdventureCatalog, FactGraph, NodeView};
use tracing::{debug, info};

/// Action name of the task handed to an adventurator.
pub const ADVENTURATE: &str = "adventurate";

/// What a solver made of a goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub solvable: bool,
    pub requires_input: bool,
    #[serde(default)]
    pub plan: Value,
}

/// Turns constraints on a node into a runnable plan.
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(&self, node_id: EntityId, constraints: &[String]) -> Result<SolveOutcome>;

    /// Re-check a plan the caller already has. Accepted as-is by default.
    async fn solve_plan(&self, node_id: EntityId, plan: &Value) -> Result<SolveOutcome> {
        debug!("Accepting supplied plan for node {}", node_id);
        Ok(SolveOutcome {
            solvable: true,
            requires_input: false,
            plan: plan.clone(),
        })
    }
}

/// Solver used when no planner is attached. Supplied plans go through;
/// bare constraints always need more input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOnlySolver;

#[async_trait]
impl Solver for PlanOnlySolver {
    async fn solve(&self, node_id: EntityId, constraints: &[String]) -> Result<SolveOutcome> {
        debug!(
            "No planner for node {} ({} constraints)",
            node_id,
            constraints.len()
        );
        Ok(SolveOutcome {
            solvable: false,
            requires_input: true,
            plan: Value::Null,
        })
    }
}

/// Result of `solve_and_run`: the solver's answer and, if it was runnable,
/// the task that now carries it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    #[serde(flatten)]
    pub solve: SolveOutcome,
    pub task: Option<Task>,
}

pub struct AdventureRunner {
    catalog: Arc<AdventureCatalog>,
    ledger: Arc<TaskLedger>,
    solver: Arc<dyn Solver>,
    capability: String,
}

impl AdventureRunner {
    pub fn new(
        catalog: Arc<AdventureCatalog>,
        ledger: Arc<TaskLedger>,
        solver: Arc<dyn Solver>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            solver,
            capability: capability.into(),
        }
    }

    fn graph(&self) -> &Arc<FactGraph> {
        self.catalog.graph()
    }

    /// The first node, by id, advertising the adventurator capability.
    pub fn find_adventurator(&self) -> Result<NodeView> {
        self.graph()
            .list_nodes()
            .into_iter()
            .find(|node| node.has_backend(&self.capability))
            .ok_or_else(|| Error::NoCapableNode(self.capability.clone()))
    }

    /// Hand an ad-hoc (solver-produced) plan to the adventurator.
    pub fn run_adventure(&self, dsl: Value, nodes: &[EntityId]) -> Result<Task> {
        self.dispatch(dsl, nodes, true, false)
    }

    /// Run a catalog adventure against `nodes`.
    pub fn run_defined_adventure(&self, adventure_id: EntityId, nodes: &[EntityId]) -> Result<Task> {
        let dsl = self.catalog.dsl(adventure_id)?;
        self.dispatch(dsl, nodes, false, true)
    }

    pub async fn solve_for_node(
        &self,
        node_id: EntityId,
        constraints: &[String],
    ) -> Result<SolveOutcome> {
        self.graph().get_node(node_id)?;
        self.solver.solve(node_id, constraints).await
    }

    /// Solve for `node_id` (or re-check `plan`) and run the result whenever
    /// it is solvable. `requires_input` is reported back but does not hold
    /// the task.
    pub async fn solve_and_run(
        &self,
        node_id: EntityId,
        constraints: &[String],
        plan: Option<Value>,
    ) -> Result<RunOutcome> {
        self.graph().get_node(node_id)?;
        let solve = match &plan {
            Some(plan) => self.solver.solve_plan(node_id, plan).await?,
            None => self.solver.solve(node_id, constraints).await?,
        };
        if !solve.solvable {
            debug!(
                "Node {}: not solvable (requires_input={})",
                node_id, solve.requires_input
            );
            return Ok(RunOutcome { solve, task: None });
        }
        let task = self.run_adventure(solve.plan.clone(), &[node_id])?;
        Ok(RunOutcome {
            solve,
            task: Some(task),
        })
    }

    fn dispatch(&self, dsl: Value, nodes: &[EntityId], solved: bool, defined: bool) -> Result<Task> {
        if nodes.is_empty() {
            return Err(Error::validation("an adventure needs at least one node"));
        }
        // Containers are passed through as given; the adventurator expands them.
        for &node_id in nodes {
            self.graph().get_node(node_id)?;
        }
        let adventurator = self.find_adventurator()?;

        let payload = json!({
            "adventure_dsl": dsl,
            "nodes": nodes,
            "globals": {
                "solved_adventure": solved,
                "defined_adventure": defined,
            },
        });
        let task = self.ledger.submit(adventurator.id(), ADVENTURATE, payload)?;
        info!(
            "Adventure task {} on {} for {} node(s)",
            task.id,
            adventurator.name(),
            nodes.len()
        );
        Ok(task)
    }
}
