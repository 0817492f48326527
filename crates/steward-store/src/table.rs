//! A single schema-backed table.
//!
//! Rows live behind their own mutex so writers to different entities never
//! contend. Unique columns are enforced through a separate index keyed by
//! `(column, value)`; claiming an index slot is atomic per key.

use crate::schema::Schema;
use dashmap::mapref::entry::Entry as IndexEntry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use steward_core::{Entity, EntityId, Error, Result};
use steward_criteria::{Functions, Predicate};
use tracing::debug;

/// `None` once the row has been deleted, so late writers holding the slot fail cleanly.
type Slot = Arc<Mutex<Option<Entity>>>;

pub struct Table {
    schema: Schema,
    pk: String,
    rows: DashMap<EntityId, Slot>,
    unique_index: DashMap<String, EntityId>,
    next_id: AtomicI64,
}

impl Table {
    pub fn new(schema: Schema) -> Result<Self> {
        schema.validate()?;
        let pk = schema
            .primary_key()
            .map(|c| c.name.clone())
            .ok_or_else(|| Error::validation("primary key required"))?;
        Ok(Self {
            schema,
            pk,
            rows: DashMap::new(),
            unique_index: DashMap::new(),
            next_id: AtomicI64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.table
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&self, values: Entity) -> Result<Entity> {
        let mut row = Entity::new();
        for (key, value) in values.into_map() {
            match self.schema.get(&key) {
                Some(column) if column.primary_key => {
                    debug!("{}: ignoring caller-supplied {}", self.name(), key);
                }
                Some(column) => {
                    row.insert(key, column.coerce(value)?);
                }
                None => {
                    row.insert(key, value);
                }
            }
        }

        for column in self.schema.columns() {
            if column.primary_key {
                continue;
            }
            let present = row.get(&column.name).map(|v| !v.is_null()).unwrap_or(false);
            if column.required && !present {
                return Err(Error::validation(format!(
                    "{}: '{}' is required",
                    self.name(),
                    column.name
                )));
            }
            if !row.contains_key(&column.name) {
                row.insert(column.name.clone(), Value::Null);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        row.insert(self.pk.clone(), Value::from(id));

        // Published locked before unique values are claimed; readers block
        // until the row is filled in.
        let slot: Slot = Arc::new(Mutex::new(None));
        let mut guard = lock(&slot)?;
        self.rows.insert(id, slot.clone());
        if let Err(e) = self.claim_unique(id, &row, None) {
            self.rows.remove(&id);
            return Err(e);
        }
        *guard = Some(row.clone());
        drop(guard);

        debug!("{}: inserted {}", self.name(), id);
        Ok(row)
    }

    pub fn get(&self, id: EntityId) -> Result<Entity> {
        let slot = self.slot(id)?;
        let guard = lock(&slot)?;
        guard.clone().ok_or_else(|| Error::not_found(self.name(), id))
    }

    pub fn update(&self, id: EntityId, partial: Entity) -> Result<Entity> {
        self.update_with(id, |_| Ok(partial))
    }

    /// Compute the partial update from the current row while holding the row's
    /// lock. Returning an error from `build` aborts the write, which makes this
    /// the compare-and-set primitive for callers.
    pub fn update_with<F>(&self, id: EntityId, build: F) -> Result<Entity>
    where
        F: FnOnce(&Entity) -> Result<Entity>,
    {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot)?;
        let current = guard
            .as_ref()
            .ok_or_else(|| Error::not_found(self.name(), id))?;

        let partial = build(current)?;
        let mut next = current.clone();

        for (key, value) in partial.into_map() {
            let Some(column) = self.schema.get(&key) else {
                next.insert(key, value);
                continue;
            };
            if column.primary_key {
                if value != Value::from(id) {
                    return Err(Error::validation(format!(
                        "{}: '{}' cannot be changed",
                        self.name(),
                        key
                    )));
                }
                continue;
            }
            if column.read_only {
                return Err(Error::validation(format!(
                    "{}: '{}' is read-only",
                    self.name(),
                    key
                )));
            }
            if !column.updatable {
                debug!("{}: dropping update to non-updatable '{}'", self.name(), key);
                continue;
            }
            let value = column.coerce(value)?;
            if column.required && value.is_null() {
                return Err(Error::validation(format!(
                    "{}: '{}' is required",
                    self.name(),
                    key
                )));
            }
            next.insert(key, value);
        }

        self.claim_unique(id, &next, Some(current))?;
        self.release_stale(id, current, &next);

        *guard = Some(next.clone());
        debug!("{}: updated {}", self.name(), id);
        Ok(next)
    }

    pub fn delete(&self, id: EntityId) -> Result<Entity> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot)?;
        let row = guard
            .take()
            .ok_or_else(|| Error::not_found(self.name(), id))?;
        self.rows.remove(&id);
        let keys: Vec<String> = self.unique_keys(&row).collect();
        self.release_keys(id, &keys);
        debug!("{}: deleted {}", self.name(), id);
        Ok(row)
    }

    /// Snapshot of every row, ordered by primary key.
    pub fn list(&self) -> Vec<Entity> {
        let slots: Vec<(EntityId, Slot)> = self
            .rows
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        let mut rows: Vec<(EntityId, Entity)> = slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let row = slot.lock().ok()?.clone()?;
                Some((id, row))
            })
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Rows for which `keep` returns true.
    pub fn find<F>(&self, keep: F) -> Vec<Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        self.list().into_iter().filter(|row| keep(row)).collect()
    }

    /// Rows matching a compiled predicate. Rows whose evaluation fails are skipped.
    pub fn query(&self, predicate: &Predicate, functions: &Functions) -> Vec<Entity> {
        self.list()
            .into_iter()
            .filter(|row| match predicate.evaluate(&row.to_value(), functions) {
                Ok(matched) => matched,
                Err(e) => {
                    debug!(
                        "{}: '{}' skipped row {:?}: {}",
                        self.name(),
                        predicate.source(),
                        row.id(),
                        e
                    );
                    false
                }
            })
            .collect()
    }

    fn slot(&self, id: EntityId) -> Result<Slot> {
        self.rows
            .get(&id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| Error::not_found(self.name(), id))
    }

    fn unique_keys<'a>(&'a self, row: &'a Entity) -> impl Iterator<Item = String> + 'a {
        self.schema
            .columns()
            .iter()
            .filter(|c| c.unique && !c.primary_key)
            .filter_map(move |c| match row.get(&c.name) {
                None | Some(Value::Null) => None,
                Some(value) => Some(format!("{}\u{0}{}", c.name, value)),
            })
    }

    /// Claims index slots for `row`'s unique values that `previous` did not
    /// already hold. All-or-nothing: a value owned by another row releases
    /// whatever this call had claimed.
    fn claim_unique(&self, id: EntityId, row: &Entity, previous: Option<&Entity>) -> Result<()> {
        let held: Vec<String> = previous
            .map(|p| self.unique_keys(p).collect())
            .unwrap_or_default();
        let mut claimed = Vec::new();
        for key in self.unique_keys(row) {
            if held.contains(&key) {
                continue;
            }
            match self.unique_index.entry(key.clone()) {
                IndexEntry::Occupied(owner) if *owner.get() != id => {
                    drop(owner);
                    self.release_keys(id, &claimed);
                    let column = key.split('\u{0}').next().unwrap_or_default().to_string();
                    return Err(Error::validation(format!(
                        "{}: '{}' must be unique",
                        self.name(),
                        column
                    )));
                }
                IndexEntry::Occupied(_) => {}
                IndexEntry::Vacant(slot) => {
                    slot.insert(id);
                    claimed.push(key);
                }
            }
        }
        Ok(())
    }

    fn release_stale(&self, id: EntityId, previous: &Entity, next: &Entity) {
        let keep: Vec<String> = self.unique_keys(next).collect();
        let stale: Vec<String> = self
            .unique_keys(previous)
            .filter(|key| !keep.contains(key))
            .collect();
        self.release_keys(id, &stale);
    }

    fn release_keys(&self, id: EntityId, keys: &[String]) {
        for key in keys {
            self.unique_index.remove_if(key, |_, owner| *owner == id);
        }
    }
}

fn lock(slot: &Slot) -> Result<MutexGuard<'_, Option<Entity>>> {
    slot.lock()
        .map_err(|_| Error::Internal("row lock poisoned".into()))
}
