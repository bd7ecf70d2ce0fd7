//! In-memory storage.
//!
//! Enforces the same constraints a relational backend would (not-null,
//! unique, unique-together, foreign keys) so that engine behavior observed
//! against it carries over to a database. Used for dry runs and tests.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::entity::{EntityRef, Record, Value};
use crate::schema::{EntityTypeDescriptor, FieldDescriptor, FieldKind, SURROGATE_KEY};

use super::{Query, Storage, StorageError};

#[derive(Debug, Clone, Default)]
struct Table {
    last_id: i64,
    rows: BTreeMap<i64, Record>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<String, Table>,
    links: HashMap<(String, String), BTreeSet<(i64, i64)>>,
}

/// Storage backed by plain maps, with snapshot transactions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,
    snapshot: Option<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities of a type.
    pub fn count(&self, entity_type: &str) -> usize {
        self.state
            .tables
            .get(entity_type)
            .map_or(0, |t| t.rows.len())
    }

    pub fn row(&self, entity_type: &str, id: i64) -> Option<&Record> {
        self.state.tables.get(entity_type)?.rows.get(&id)
    }

    pub fn rows(&self, entity_type: &str) -> Vec<(i64, &Record)> {
        self.state
            .tables
            .get(entity_type)
            .map(|t| t.rows.iter().map(|(id, row)| (*id, row)).collect())
            .unwrap_or_default()
    }

    /// First stored entity whose `field` equals `value`.
    pub fn find_row(&self, entity_type: &str, field: &str, value: &Value) -> Option<(i64, &Record)> {
        self.rows(entity_type)
            .into_iter()
            .find(|(_, row)| row.get(field) == Some(value))
    }

    /// Native links of a collection field as (owner id, related id) pairs.
    pub fn links(&self, entity_type: &str, field: &str) -> Vec<(i64, i64)> {
        self.state
            .links
            .get(&(entity_type.to_string(), field.to_string()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn exists(&self, r: &EntityRef) -> bool {
        self.row(&r.entity_type, r.id).is_some()
    }

    fn build_row(&self, descriptor: &EntityTypeDescriptor, values: &Record) -> Record {
        let now = Value::DateTime(Utc::now().naive_utc());
        let mut row = Record::new();
        for field in descriptor.fields.iter().filter(|f| !f.is_collection()) {
            let value = if field.is_auto_managed() {
                now.clone()
            } else if let Some(v) = values.get(&field.name) {
                v.clone()
            } else {
                default_value(field)
            };
            row.insert(field.name.clone(), value);
        }
        row
    }

    fn check_row(
        &self,
        descriptor: &EntityTypeDescriptor,
        id: Option<i64>,
        row: &Record,
    ) -> Result<(), StorageError> {
        let table = descriptor.table_name();

        for field in descriptor.fields.iter().filter(|f| !f.is_collection()) {
            let value = row.get(&field.name).unwrap_or(&Value::Null);
            if value.is_null() && !field.nullable {
                return Err(StorageError::Constraint(format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    field.name, table
                )));
            }
            if let (FieldKind::Reference { to, .. }, Value::Entity(target)) = (&field.kind, value) {
                if &target.entity_type != to || !self.exists(target) {
                    return Err(StorageError::Constraint(format!(
                        "insert or update on table \"{}\" violates foreign key constraint on \"{}\": {} does not exist",
                        table, field.name, target
                    )));
                }
            }
        }

        let others: Vec<&Record> = self
            .state
            .tables
            .get(&descriptor.name)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(other_id, _)| Some(**other_id) != id)
                    .map(|(_, r)| r)
                    .collect()
            })
            .unwrap_or_default();

        let mut groups: Vec<Vec<&str>> = descriptor
            .fields
            .iter()
            .filter(|f| f.unique)
            .map(|f| vec![f.name.as_str()])
            .collect();
        groups.extend(
            descriptor
                .unique_together
                .iter()
                .map(|g| g.iter().map(String::as_str).collect()),
        );

        for group in groups {
            let key: Vec<&Value> = group
                .iter()
                .map(|name| row.get(*name).unwrap_or(&Value::Null))
                .collect();
            // NULLs never collide, as in SQL.
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let duplicate = others.iter().any(|other| {
                group
                    .iter()
                    .zip(&key)
                    .all(|(name, v)| other.get(*name) == Some(*v))
            });
            if duplicate {
                return Err(StorageError::Constraint(format!(
                    "duplicate key value violates unique constraint on \"{}\" ({})",
                    table,
                    group.join(", ")
                )));
            }
        }

        Ok(())
    }
}

/// Value a column takes when a create does not supply it.
fn default_value(field: &FieldDescriptor) -> Value {
    match field.kind {
        _ if field.nullable => Value::Null,
        FieldKind::Text => Value::String(String::new()),
        FieldKind::Boolean => Value::Bool(false),
        _ => Value::Null,
    }
}

fn matches_query(id: i64, row: &Record, query: &Query) -> bool {
    query.conditions.iter().all(|(field, value)| {
        if field == SURROGATE_KEY {
            *value == Value::Int(id)
        } else {
            row.get(field) == Some(value)
        }
    })
}

impl Storage for MemoryStore {
    fn get(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        id: i64,
    ) -> Result<Option<EntityRef>, StorageError> {
        Ok(self
            .row(&descriptor.name, id)
            .map(|_| EntityRef::new(&descriptor.name, id)))
    }

    fn find(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        query: &Query,
    ) -> Result<Vec<EntityRef>, StorageError> {
        Ok(self
            .rows(&descriptor.name)
            .into_iter()
            .filter(|(id, row)| matches_query(*id, row, query))
            .map(|(id, _)| EntityRef::new(&descriptor.name, id))
            .collect())
    }

    fn create(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        values: &Record,
    ) -> Result<EntityRef, StorageError> {
        let row = self.build_row(descriptor, values);
        self.check_row(descriptor, None, &row)?;

        let table = self.state.tables.entry(descriptor.name.clone()).or_default();
        table.last_id += 1;
        let id = table.last_id;
        table.rows.insert(id, row);
        Ok(EntityRef::new(&descriptor.name, id))
    }

    fn update(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        target: &EntityRef,
        values: &Record,
    ) -> Result<bool, StorageError> {
        let current = self
            .row(&descriptor.name, target.id)
            .ok_or_else(|| StorageError::Constraint(format!("{} does not exist", target)))?;

        let mut row = current.clone();
        let mut changed = false;
        for (name, value) in values {
            let Some(field) = descriptor.get_field(name) else {
                continue;
            };
            if field.is_collection() || field.is_auto_managed() {
                continue;
            }
            if row.get(name) != Some(value) {
                row.insert(name.clone(), value.clone());
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        let now = Value::DateTime(Utc::now().naive_utc());
        for field in &descriptor.fields {
            if matches!(field.kind, FieldKind::DateTime { auto_now: true, .. }) {
                row.insert(field.name.clone(), now.clone());
            }
        }

        self.check_row(descriptor, Some(target.id), &row)?;
        if let Some(table) = self.state.tables.get_mut(&descriptor.name) {
            table.rows.insert(target.id, row);
        }
        Ok(true)
    }

    fn add_related(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        field: &FieldDescriptor,
        owner: &EntityRef,
        related: &[EntityRef],
    ) -> Result<(), StorageError> {
        let FieldKind::Collection { to, through, .. } = &field.kind else {
            return Err(StorageError::Unsupported(format!(
                "{}.{} is not a collection",
                descriptor.name, field.name
            )));
        };
        if through.is_some() {
            return Err(StorageError::Unsupported(format!(
                "{}.{} links through an intermediate entity",
                descriptor.name, field.name
            )));
        }
        if !self.exists(owner) {
            return Err(StorageError::Constraint(format!("{} does not exist", owner)));
        }
        if let Some(missing) = related.iter().find(|r| &r.entity_type != to || !self.exists(r)) {
            return Err(StorageError::Constraint(format!(
                "cannot link {} to {}.{}: not a stored {}",
                missing, descriptor.name, field.name, to
            )));
        }

        let links = self
            .state
            .links
            .entry((descriptor.name.clone(), field.name.clone()))
            .or_default();
        for r in related {
            links.insert((owner.id, r.id));
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        if self.snapshot.is_some() {
            return Err(StorageError::Backend("transaction already open".to_string()));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
        }
        Ok(())
    }
}
