//! Task records and the task state machine.
//!
//! A pending task may move to any state, a delivered one to anything but
//! pending, a running one only to a terminal state (done, error or
//! cancelled). Terminal states are final.
//!
//! `completed` is stamped by the ledger when a task enters a terminal
//! state; `submitted` is stamped once at creation and never changes.

use crate::coordinator::DispatchCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use steward_core::config::TaskConfig;
use steward_core::{
    json_type_name, task_key, Clock, Entity, EntityId, Error, Result, SystemClock, TaskState,
};
use steward_store::{Column, ColumnType, Schema, Table, TypedStore};
use tracing::{debug, info};

pub const TASKS: &str = "tasks";

pub fn schema() -> Schema {
    Schema::new(TASKS)
        .column(Column::new("id", ColumnType::Integer).primary_key())
        .column(Column::new("node_id", ColumnType::Integer).required())
        .column(Column::new("action", ColumnType::Text(64)).required())
        .column(Column::new("payload", ColumnType::StructuredBlob).required())
        .column(Column::new("state", ColumnType::Text(16)).required())
        .column(Column::new("result", ColumnType::StructuredBlob))
        .column(Column::new("submitted", ColumnType::Integer).not_updatable())
        .column(Column::new("completed", ColumnType::Integer))
        .column(Column::new("expires", ColumnType::Integer))
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task row. Attributes outside the declared columns are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub node_id: EntityId,
    pub action: String,
    pub payload: Value,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    pub submitted: i64,
    #[serde(default)]
    pub completed: Option<i64>,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    fn from_entity(entity: Entity) -> Result<Self> {
        Ok(serde_json::from_value(entity.into_value())?)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct TaskLedger {
    table: Arc<Table>,
    coordinator: Arc<DispatchCoordinator>,
    clock: Arc<dyn Clock>,
    retention_secs: i64,
}

impl TaskLedger {
    pub fn new(
        store: &TypedStore,
        coordinator: Arc<DispatchCoordinator>,
        config: &TaskConfig,
    ) -> Result<Self> {
        Self::with_clock(store, coordinator, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: &TypedStore,
        coordinator: Arc<DispatchCoordinator>,
        config: &TaskConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let table = store.register(schema())?;
        Ok(Self {
            table,
            coordinator,
            clock,
            retention_secs: config.retention_secs,
        })
    }

    pub fn coordinator(&self) -> &Arc<DispatchCoordinator> {
        &self.coordinator
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Create a task from a raw row.
    ///
    /// `state` defaults to pending. `submitted` is always the current time.
    /// `completed` is kept only when the initial state is terminal, and is
    /// stamped if missing in that case.
    pub fn create(&self, mut values: Entity) -> Result<Task> {
        let now = self.clock.now();
        let state = match values.remove("state") {
            None | Some(Value::Null) => TaskState::Pending,
            Some(value) => parse_state(&value)?,
        };
        values.insert("state", Value::from(state.as_str()));
        values.insert("submitted", Value::from(now));

        let completed = values.remove("completed").unwrap_or(Value::Null);
        if state.is_terminal() {
            let completed = if completed.is_null() {
                Value::from(now)
            } else {
                completed
            };
            values.insert("completed", completed);
        } else {
            values.insert("completed", Value::Null);
        }

        let task = Task::from_entity(self.table.insert(values)?)?;
        info!(
            "Task {} created for node {}: {} ({})",
            task.id, task.node_id, task.action, task.state
        );
        if task.state == TaskState::Pending {
            self.coordinator.notify(&task_key(task.node_id));
        }
        Ok(task)
    }

    /// Create a pending task for `node_id`.
    pub fn submit(&self, node_id: EntityId, action: &str, payload: Value) -> Result<Task> {
        let mut values = Entity::new();
        values.insert("node_id", Value::from(node_id));
        values.insert("action", Value::from(action));
        values.insert("payload", payload);
        self.create(values)
    }

    pub fn get(&self, id: EntityId) -> Result<Task> {
        Task::from_entity(self.table.get(id)?)
    }

    /// Apply a partial update under the task's lock.
    ///
    /// Writes to `submitted` are dropped. A state change must be an edge of
    /// the state machine; entering a terminal state stamps `completed`,
    /// replacing any value supplied alongside it. Moving a pending task to
    /// another node wakes that node's pollers.
    pub fn update(&self, id: EntityId, partial: Entity) -> Result<Task> {
        let now = self.clock.now();
        let mut previous_node = None;
        let mut transition = None;

        let row = self.table.update_with(id, |current| {
            let mut partial = partial;
            previous_node = current.get_i64("node_id");
            if partial.remove("submitted").is_some() {
                debug!("Task {}: ignoring write to submitted", id);
            }

            let from = state_of(current)?;
            if let Some(value) = partial.remove("state") {
                let to = parse_state(&value)?;
                if to != from {
                    if !from.can_transition_to(to) {
                        return Err(Error::invalid_transition(from, to));
                    }
                    if to.is_terminal() {
                        partial.insert("completed", Value::from(now));
                    }
                    transition = Some((from, to));
                }
                partial.insert("state", Value::from(to.as_str()));
            }
            Ok(partial)
        })?;

        let task = Task::from_entity(row)?;
        match transition {
            Some((from, to)) if to.is_terminal() => {
                info!("Task {} finished: {} -> {}", task.id, from, to)
            }
            Some((from, to)) => debug!("Task {}: {} -> {}", task.id, from, to),
            None => {}
        }
        if task.state == TaskState::Pending && previous_node != Some(task.node_id) {
            debug!("Task {} moved to node {}", task.id, task.node_id);
            self.coordinator.notify(&task_key(task.node_id));
        }
        Ok(task)
    }

    pub fn delete(&self, id: EntityId) -> Result<Task> {
        let task = Task::from_entity(self.table.delete(id)?)?;
        debug!("Task {} deleted", id);
        Ok(task)
    }

    /// Every task, after pruning expired terminal ones.
    pub fn list(&self) -> Vec<Task> {
        self.prune(self.clock.now());
        self.rows()
    }

    pub fn tasks_for(&self, node_id: EntityId) -> Vec<Task> {
        self.rows()
            .into_iter()
            .filter(|task| task.node_id == node_id)
            .collect()
    }

    /// The oldest pending task for `node_id`, unchanged.
    pub fn claim_next_pending(&self, node_id: EntityId) -> Option<Task> {
        self.rows()
            .into_iter()
            .find(|task| task.node_id == node_id && task.state == TaskState::Pending)
    }

    /// Move task `id` out of pending into `to`.
    ///
    /// Fails with `Conflict` if the task is no longer pending, which is how
    /// the loser of two concurrent claims finds out.
    pub fn claim(&self, id: EntityId, to: TaskState) -> Result<Task> {
        if !matches!(to, TaskState::Delivered | TaskState::Running) {
            return Err(Error::validation(format!("cannot claim a task into {}", to)));
        }
        let row = self.table.update_with(id, |current| {
            let from = state_of(current)?;
            if from != TaskState::Pending {
                return Err(Error::conflict(format!("task {} is already {}", id, from)));
            }
            let mut partial = Entity::new();
            partial.insert("state", Value::from(to.as_str()));
            Ok(partial)
        })?;
        let task = Task::from_entity(row)?;
        debug!("Task {} claimed for node {} ({})", task.id, task.node_id, to);
        Ok(task)
    }

    /// Peek and claim the next pending task as delivered. Tasks lost to a
    /// concurrent claimant are skipped.
    pub fn deliver_next(&self, node_id: EntityId) -> Result<Option<Task>> {
        while let Some(task) = self.claim_next_pending(node_id) {
            match self.claim(task.id, TaskState::Delivered) {
                Ok(task) => return Ok(Some(task)),
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!("Task {} taken concurrently, retrying", task.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Delete terminal tasks completed more than `retention_secs` before `now`.
    /// A non-positive retention keeps everything.
    pub fn prune(&self, now: i64) -> usize {
        if self.retention_secs <= 0 {
            return 0;
        }
        let cutoff = now - self.retention_secs;
        let stale: Vec<EntityId> = self
            .rows()
            .into_iter()
            .filter(|task| task.state.is_terminal())
            .filter(|task| task.completed.map(|at| at < cutoff).unwrap_or(false))
            .map(|task| task.id)
            .collect();

        let pruned = stale
            .into_iter()
            .filter(|id| self.table.delete(*id).is_ok())
            .count();
        if pruned > 0 {
            info!("Pruned {} finished tasks", pruned);
        }
        pruned
    }

    fn rows(&self) -> Vec<Task> {
        self.table
            .list()
            .into_iter()
            .filter_map(|row| {
                let id = row.id();
                Task::from_entity(row)
                    .map_err(|e| debug!("Skipping unreadable task {:?}: {}", id, e))
                    .ok()
            })
            .collect()
    }
}

fn parse_state(value: &Value) -> Result<TaskState> {
    match value {
        Value::String(s) => TaskState::from_str(&s.to_lowercase()),
        other => Err(Error::type_mismatch("state", "task state", json_type_name(other))),
    }
}

fn state_of(row: &Entity) -> Result<TaskState> {
    let state = row
        .get("state")
        .ok_or_else(|| Error::Internal("task without state".into()))?;
    parse_state(state)
}
