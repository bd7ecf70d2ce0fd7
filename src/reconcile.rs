//! Reconciler / upsert core.
//!
//! One call turns one input value into exactly one [`Outcome`]:
//!
//! ```text
//! START -> PREPARE -> (already identified? -> EXISTS)
//!                  -> IDENTITY QUERY -> 0  -> CREATE | REJECT (creation disabled)
//!                                    -> 1  -> UPDATE | EXISTS
//!                                    -> >1 -> REJECT (ambiguous)
//! CREATE / UPDATE / EXISTS -> ATTACH RELATIONSHIPS -> DONE
//! ```
//!
//! Reference fields recurse into the same machine with the related entity
//! type. Storage constraint violations are reported as a `Rejected` outcome
//! at the top level, and raised from nested calls so the parent fails as a
//! whole.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::entity::{EntityRef, Record, Value};
use crate::error::{EtlError, Result};
use crate::identity::{self, CriterionSource, PersistenceCriterion};
use crate::prepare::{self, ReferenceResolver};
use crate::schema::{inspector, EntityTypeDescriptor, FieldDescriptor, FieldKind, Schema, SURROGATE_KEY};
use crate::storage::{Query, Storage};

/// Per-record override of the persistence criterion.
pub const CONTROL_PERSISTENCE: &str = "etl_persistence";
/// Per-record override of the create flag.
pub const CONTROL_CREATE: &str = "etl_create";
/// Per-record override of the update flag.
pub const CONTROL_UPDATE: &str = "etl_update";

fn default_max_depth() -> usize {
    16
}

fn default_true() -> bool {
    true
}

/// Engine options of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Explicit persistence criterion.
    #[serde(default)]
    pub persistence: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default = "default_true")]
    pub update: bool,
    /// Allow creating records behind single references.
    #[serde(default = "default_true")]
    pub create_foreign_key: bool,
    /// Use content-hash identity where the entity type declares a hash field.
    #[serde(default = "default_true")]
    pub hash: bool,
    #[serde(default = "default_true")]
    pub truncate_on_overflow: bool,
    #[serde(default = "default_true")]
    pub reduce_geometry_dimension: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            persistence: None,
            create: true,
            update: true,
            create_foreign_key: true,
            hash: true,
            truncate_on_overflow: true,
            reduce_geometry_dimension: true,
            max_depth: default_max_depth(),
        }
    }
}

impl ReconcileOptions {
    pub fn with_persistence<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.persistence = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    pub fn with_create_foreign_key(mut self, create_foreign_key: bool) -> Self {
        self.create_foreign_key = create_foreign_key;
        self
    }

    /// Options for the record behind a single reference.
    fn for_reference(&self, persistence: Option<Vec<String>>) -> Self {
        Self {
            persistence,
            create: self.create_foreign_key,
            update: false,
            ..self.clone()
        }
    }

    /// Options for a collection member.
    fn for_member(&self) -> Self {
        Self {
            persistence: None,
            create: true,
            update: true,
            ..self.clone()
        }
    }

    /// Options for the link record of a through relation.
    pub(crate) fn for_link(&self, source_field: &str, target_field: &str) -> Self {
        Self {
            persistence: Some(vec![source_field.to_string(), target_field.to_string()]),
            create: true,
            update: true,
            create_foreign_key: false,
            ..self.clone()
        }
    }
}

/// Result category of a reconciliation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    /// Already present and left unchanged.
    Exists,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Exists => "exists",
            Outcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// The criterion matched several stored records.
    AmbiguousMatch { count: usize, criterion: Vec<String> },
    /// Nothing matched and creation is disabled.
    CreateDisabled { criterion: Vec<String> },
    /// Storage refused the write.
    Constraint { message: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AmbiguousMatch { count, criterion } => write!(
                f,
                "{} stored records match on ({})",
                count,
                criterion.join(", ")
            ),
            RejectReason::CreateDisabled { criterion } => write!(
                f,
                "no stored record matches on ({}) and creation is disabled",
                criterion.join(", ")
            ),
            RejectReason::Constraint { message } => f.write_str(message),
        }
    }
}

/// Context of a rejected record, enough for a line-numbered log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub entity_type: String,
    #[serde(flatten)]
    pub reason: RejectReason,
    /// Input as given by the caller.
    pub raw: Value,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rejected: {}", self.entity_type, self.reason)
    }
}

/// Entity and outcome of one reconciliation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub entity: Option<EntityRef>,
    pub outcome: Outcome,
    pub rejection: Option<Rejection>,
}

impl Reconciled {
    fn stored(entity: EntityRef, outcome: Outcome) -> Self {
        Self {
            entity: Some(entity),
            outcome,
            rejection: None,
        }
    }

    fn rejected(entity_type: &str, reason: RejectReason, raw: &Value) -> Self {
        Self {
            entity: None,
            outcome: Outcome::Rejected,
            rejection: Some(Rejection {
                entity_type: entity_type.to_string(),
                reason,
                raw: raw.clone(),
            }),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.outcome == Outcome::Rejected
    }
}

/// Control keys stripped from an input record.
#[derive(Debug, Default)]
struct Control {
    persistence: Option<Vec<String>>,
    create: Option<bool>,
    update: Option<bool>,
}

fn split_control(entity_type: &str, input: &Record) -> Result<(Record, Control)> {
    let mut record = input.clone();
    let mut control = Control::default();

    if let Some(raw) = record.shift_remove(CONTROL_PERSISTENCE) {
        control.persistence = match raw {
            Value::Null => None,
            Value::String(field) => Some(vec![field]),
            Value::List(items) => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| EtlError::InvalidInput {
                            entity_type: entity_type.to_string(),
                            message: format!("{} must list field names", CONTROL_PERSISTENCE),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => {
                return Err(EtlError::InvalidInput {
                    entity_type: entity_type.to_string(),
                    message: format!("{} cannot be a {}", CONTROL_PERSISTENCE, other.type_name()),
                })
            }
        };
    }
    control.create = record.shift_remove(CONTROL_CREATE).map(|v| prepare::is_truthy(&v));
    control.update = record.shift_remove(CONTROL_UPDATE).map(|v| prepare::is_truthy(&v));

    Ok((record, control))
}

/// Reconciliation engine bound to a schema and a storage session.
pub struct Reconciler<'a, S: Storage + ?Sized> {
    pub(crate) schema: &'a Schema,
    pub(crate) storage: &'a mut S,
}

impl<'a, S: Storage + ?Sized> Reconciler<'a, S> {
    pub fn new(schema: &'a Schema, storage: &'a mut S) -> Self {
        Self { schema, storage }
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    /// Reconcile one input value against storage.
    ///
    /// `input` may be a record (`Value::Dict`), a stored entity, a primary
    /// key, or a bare scalar resolved through the entity type's single
    /// identity field. Storage constraint violations, including those raised
    /// while resolving nested references, come back as a `Rejected` outcome;
    /// every other error is returned.
    pub fn get_instance(
        &mut self,
        entity_type: &str,
        input: &Value,
        options: &ReconcileOptions,
    ) -> Result<Reconciled> {
        match self.reconcile(entity_type, input, options, 0) {
            Err(err @ EtlError::StorageConstraint { .. }) => {
                tracing::debug!(entity = %entity_type, error = %err, "Rejected by storage");
                Ok(Reconciled::rejected(
                    entity_type,
                    RejectReason::Constraint {
                        message: err.to_string(),
                    },
                    input,
                ))
            }
            other => other,
        }
    }

    /// [`Reconciler::get_instance`] for a record.
    pub fn reconcile_record(
        &mut self,
        entity_type: &str,
        record: Record,
        options: &ReconcileOptions,
    ) -> Result<Reconciled> {
        self.get_instance(entity_type, &Value::Dict(record), options)
    }

    pub(crate) fn reconcile(
        &mut self,
        entity_type: &str,
        input: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<Reconciled> {
        if depth > options.max_depth {
            return Err(EtlError::CyclicReference {
                entity_type: entity_type.to_string(),
                max_depth: options.max_depth,
            });
        }

        let schema = self.schema;
        let descriptor = schema.descriptor(entity_type)?;

        match input {
            Value::Entity(entity) => {
                if entity.entity_type != descriptor.name {
                    return Err(EtlError::InvalidInput {
                        entity_type: descriptor.name.clone(),
                        message: format!("got a stored {}", entity),
                    });
                }
                tracing::debug!(entity = %entity, "Already a stored entity");
                Ok(Reconciled::stored(entity.clone(), Outcome::Exists))
            }
            Value::Int(id) => {
                let entity = self.lookup_key(descriptor, *id)?;
                Ok(Reconciled::stored(entity, Outcome::Exists))
            }
            Value::Dict(record) => self.reconcile_dict(descriptor, record, input, options, depth),
            Value::Null | Value::List(_) => Err(EtlError::InvalidInput {
                entity_type: descriptor.name.clone(),
                message: format!("cannot reconcile a {}", input.type_name()),
            }),
            scalar => {
                let field = inspector::single_identity_field(descriptor)?;
                let mut record = Record::new();
                record.insert(field, scalar.clone());
                self.reconcile_dict(descriptor, &record, input, options, depth)
            }
        }
    }

    /// Primary-key lookup; a missing key is an error, not a miss.
    fn lookup_key(&mut self, descriptor: &EntityTypeDescriptor, id: i64) -> Result<EntityRef> {
        self.storage
            .get(descriptor, id)
            .map_err(|e| EtlError::from_storage(&descriptor.name, e))?
            .ok_or_else(|| EtlError::ReferenceNotFound {
                entity_type: descriptor.name.clone(),
                field: SURROGATE_KEY.to_string(),
                value: id.to_string(),
            })
    }

    fn find(&mut self, descriptor: &EntityTypeDescriptor, query: &Query) -> Result<Vec<EntityRef>> {
        self.storage
            .find(descriptor, query)
            .map_err(|e| EtlError::from_storage(&descriptor.name, e))
    }

    fn reconcile_dict(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        input: &Record,
        raw: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<Reconciled> {
        let (record, control) = split_control(&descriptor.name, input)?;
        let options = if control.create.is_some() || control.update.is_some() {
            let mut effective = options.clone();
            effective.create = control.create.unwrap_or(options.create);
            effective.update = control.update.unwrap_or(options.update);
            Cow::Owned(effective)
        } else {
            Cow::Borrowed(options)
        };

        let identified = match record.get(SURROGATE_KEY) {
            None | Some(Value::Null) => None,
            Some(key) => Some(self.lookup_key(descriptor, surrogate_key(descriptor, key)?)?),
        };

        let prepared = prepare::prepare(descriptor, &record, &options, self, depth)?;
        let mut values = prepared.values;

        let hash_field = identity::hash_field(descriptor, &options);
        let hash = hash_field.map(|field| {
            let hash = Value::String(identity::content_hash(descriptor, &values));
            values.insert(field.to_string(), hash.clone());
            (field, hash)
        });

        let (matched, criterion) = match identified {
            Some(entity) => (
                vec![entity],
                PersistenceCriterion {
                    fields: vec![SURROGATE_KEY.to_string()],
                    source: CriterionSource::Record,
                },
            ),
            None => {
                if let Some((field, hash)) = hash {
                    let query = Query::new().eq(field, hash);
                    let hits = self.find(descriptor, &query)?;
                    match hits.as_slice() {
                        [] => {}
                        [entity] => {
                            tracing::debug!(entity = %entity, "Content hash matches; nothing to update");
                            self.attach(descriptor, entity, &prepared.deferred, &options, depth)?;
                            return Ok(Reconciled::stored(entity.clone(), Outcome::Exists));
                        }
                        _ => {
                            return Ok(Reconciled::rejected(
                                &descriptor.name,
                                RejectReason::AmbiguousMatch {
                                    count: hits.len(),
                                    criterion: vec![field.to_string()],
                                },
                                raw,
                            ))
                        }
                    }
                }

                let criterion = identity::resolve(descriptor, control.persistence.as_deref(), &options)?;
                let matched = match (criterion.source, criterion.query(&values)) {
                    // The hash query above already came back empty.
                    (CriterionSource::Hash, _) | (_, None) => Vec::new(),
                    (_, Some(query)) => self.find(descriptor, &query)?,
                };
                (matched, criterion)
            }
        };

        tracing::debug!(
            entity = %descriptor.name,
            criterion = %criterion,
            matches = matched.len(),
            "Identity query"
        );

        match matched.as_slice() {
            [] => {
                if !options.create {
                    return Ok(Reconciled::rejected(
                        &descriptor.name,
                        RejectReason::CreateDisabled {
                            criterion: criterion.fields,
                        },
                        raw,
                    ));
                }
                let entity = self
                    .storage
                    .create(descriptor, &values)
                    .map_err(|e| EtlError::from_storage(&descriptor.name, e))?;
                tracing::debug!(entity = %entity, "Created");
                self.attach(descriptor, &entity, &prepared.deferred, &options, depth)?;
                Ok(Reconciled::stored(entity, Outcome::Created))
            }
            [entity] => {
                let mut outcome = Outcome::Exists;
                if options.update {
                    let changes = update_values(descriptor, &record, &values, hash_field);
                    let changed = !changes.is_empty()
                        && self
                            .storage
                            .update(descriptor, entity, &changes)
                            .map_err(|e| EtlError::from_storage(&descriptor.name, e))?;
                    if changed {
                        tracing::debug!(entity = %entity, fields = changes.len(), "Updated");
                        outcome = Outcome::Updated;
                    }
                }
                self.attach(descriptor, entity, &prepared.deferred, &options, depth)?;
                Ok(Reconciled::stored(entity.clone(), outcome))
            }
            _ => Ok(Reconciled::rejected(
                &descriptor.name,
                RejectReason::AmbiguousMatch {
                    count: matched.len(),
                    criterion: criterion.fields,
                },
                raw,
            )),
        }
    }

    /// Nested reconciliation whose rejection fails the caller.
    fn reconcile_nested(
        &mut self,
        entity_type: &str,
        input: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<EntityRef> {
        let result = self.reconcile(entity_type, input, options, depth + 1)?;
        match (result.entity, result.rejection) {
            (Some(entity), _) => Ok(entity),
            (None, rejection) => Err(EtlError::StorageConstraint {
                entity_type: entity_type.to_string(),
                message: rejection
                    .map(|r| r.reason.to_string())
                    .unwrap_or_else(|| "unresolved".to_string()),
            }),
        }
    }
}

/// Surrogate key given inside a record.
fn surrogate_key(descriptor: &EntityTypeDescriptor, key: &Value) -> Result<i64> {
    match key {
        Value::Int(id) => Ok(*id),
        Value::String(s) => s.trim().parse().map_err(|_| EtlError::InvalidInput {
            entity_type: descriptor.name.clone(),
            message: format!("'{}' is not a valid {}", s, SURROGATE_KEY),
        }),
        other => Err(EtlError::InvalidInput {
            entity_type: descriptor.name.clone(),
            message: format!("{} cannot be a {}", SURROGATE_KEY, other.type_name()),
        }),
    }
}

/// Values an update may write: fields supplied by this input, plus the hash.
fn update_values(
    descriptor: &EntityTypeDescriptor,
    input: &Record,
    values: &Record,
    hash_field: Option<&str>,
) -> Record {
    values
        .iter()
        .filter(|(name, _)| {
            descriptor.get_field(name).is_some()
                && (input.contains_key(name.as_str()) || hash_field == Some(name.as_str()))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

impl<'a, S: Storage + ?Sized> ReferenceResolver for Reconciler<'a, S> {
    fn resolve_reference(
        &mut self,
        field: &FieldDescriptor,
        raw: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<Value> {
        let FieldKind::Reference { to, to_field } = &field.kind else {
            return Err(EtlError::InvalidInput {
                entity_type: field.kind.target().unwrap_or_default().to_string(),
                message: format!("{} is not a single reference", field.name),
            });
        };
        let schema = self.schema;
        let target = schema.descriptor(to)?;
        let by_key = to_field == SURROGATE_KEY;

        let (input, persistence) = match raw {
            Value::Null => return Ok(Value::Null),
            Value::Entity(_) => (Cow::Borrowed(raw), None),
            Value::Dict(record) => {
                let persistence = if by_key {
                    inspector::unambiguous_identity_fields(target)
                        .ok()
                        .filter(|fields| fields.iter().all(|f| record.contains_key(f.as_str())))
                } else {
                    Some(vec![to_field.clone()])
                };
                (Cow::Borrowed(raw), persistence)
            }
            Value::List(_) => {
                return Err(EtlError::validation(
                    &target.name,
                    &field.name,
                    "a list cannot fill a single reference",
                ))
            }
            // Integers are keys, other scalars go through the identity field.
            _ if by_key => (Cow::Borrowed(raw), None),
            scalar => {
                let mut record = Record::new();
                record.insert(to_field.clone(), scalar.clone());
                (Cow::Owned(Value::Dict(record)), Some(vec![to_field.clone()]))
            }
        };

        let nested = options.for_reference(persistence);
        let entity = self.reconcile_nested(to, &input, &nested, depth)?;
        Ok(Value::Entity(entity))
    }

    fn resolve_member(
        &mut self,
        field: &FieldDescriptor,
        item: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<EntityRef> {
        let FieldKind::Collection { to, .. } = &field.kind else {
            return Err(EtlError::InvalidInput {
                entity_type: field.kind.target().unwrap_or_default().to_string(),
                message: format!("{} is not a collection", field.name),
            });
        };
        self.reconcile_nested(to, item, &options.for_member(), depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::storage::MemoryStore;

    fn schema() -> Schema {
        Schema::new(vec![
            EntityTypeDescriptor::new("Person")
                .field(FieldDescriptor::text("name").max_length(10).unique())
                .field(FieldDescriptor::integer("age").nullable()),
            EntityTypeDescriptor::new("Order")
                .field(FieldDescriptor::text("record").unique())
                .field(FieldDescriptor::reference("customer", "Person").to_field("name"))
                .field(FieldDescriptor::text("tag").nullable()),
        ])
        .unwrap()
    }

    #[test]
    fn test_control_keys_stripped() {
        let input = record! {
            "name" => "Ann",
            CONTROL_PERSISTENCE => vec![Value::from("name")],
            CONTROL_CREATE => "0",
        };
        let (record, control) = split_control("Person", &input).unwrap();

        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(control.persistence, Some(vec!["name".to_string()]));
        assert_eq!(control.create, Some(false));
        assert_eq!(control.update, None);
    }

    #[test]
    fn test_person_lifecycle() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);
        let options = ReconcileOptions::default();

        let first = reconciler.reconcile_record("Person", record! { "name" => "Ann" }, &options).unwrap();
        assert_eq!(first.outcome, Outcome::Created);

        let second = reconciler.reconcile_record("Person", record! { "name" => "Ann" }, &options).unwrap();
        assert_eq!(second.outcome, Outcome::Exists);
        assert_eq!(second.entity, first.entity);

        let third = reconciler
            .reconcile_record("Person", record! { "name" => "Ann", "age" => 30 }, &options)
            .unwrap();
        assert_eq!(third.outcome, Outcome::Updated);
        assert_eq!(store.count("Person"), 1);
        assert_eq!(store.row("Person", 1).unwrap()["age"], Value::Int(30));
    }

    #[test]
    fn test_bare_values() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);
        let options = ReconcileOptions::default();

        let ann = reconciler.get_instance("Person", &Value::from("Ann"), &options).unwrap();
        assert_eq!(ann.outcome, Outcome::Created);

        let by_key = reconciler.get_instance("Person", &Value::Int(1), &options).unwrap();
        assert_eq!(by_key.outcome, Outcome::Exists);
        assert_eq!(by_key.entity, ann.entity);

        let err = reconciler.get_instance("Person", &Value::Int(99), &options).unwrap_err();
        assert!(matches!(err, EtlError::ReferenceNotFound { .. }));
    }

    #[test]
    fn test_create_disabled_rejects() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);

        let result = reconciler
            .reconcile_record("Person", record! { "name" => "Ann" }, &ReconcileOptions::default().with_create(false))
            .unwrap();
        assert_eq!(result.outcome, Outcome::Rejected);
        assert!(matches!(
            result.rejection.unwrap().reason,
            RejectReason::CreateDisabled { ref criterion } if criterion == &["name".to_string()]
        ));
        assert_eq!(store.count("Person"), 0);
    }

    #[test]
    fn test_reference_by_target_field() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);

        let result = reconciler
            .reconcile_record(
                "Order",
                record! { "record" => "A1", "customer" => "Ann" },
                &ReconcileOptions::default(),
            )
            .unwrap();
        assert_eq!(result.outcome, Outcome::Created);
        assert_eq!(store.count("Person"), 1);
        assert_eq!(
            store.row("Order", 1).unwrap()["customer"],
            Value::Entity(EntityRef::new("Person", 1))
        );
    }

    #[test]
    fn test_depth_guard() {
        let schema = Schema::new(vec![EntityTypeDescriptor::new("Node")
            .field(FieldDescriptor::text("name").unique())
            .field(FieldDescriptor::reference("parent", "Node").nullable())])
        .unwrap();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);
        let options = ReconcileOptions {
            max_depth: 2,
            ..ReconcileOptions::default()
        };

        let mut input = record! { "name" => "leaf" };
        for level in 0..4 {
            input = record! { "name" => format!("n{level}"), "parent" => input };
        }
        let err = reconciler.reconcile_record("Node", input, &options).unwrap_err();
        assert!(matches!(err, EtlError::CyclicReference { max_depth: 2, .. }));
    }

    #[test]
    fn test_record_with_surrogate_key() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let mut reconciler = Reconciler::new(&schema, &mut store);
        let options = ReconcileOptions::default();

        reconciler.reconcile_record("Person", record! { "name" => "Ann" }, &options).unwrap();
        let renamed = reconciler
            .reconcile_record("Person", record! { "id" => 1, "name" => "Anna" }, &options)
            .unwrap();
        assert_eq!(renamed.outcome, Outcome::Updated);

        let err = reconciler
            .reconcile_record("Person", record! { "id" => 5, "name" => "Bob" }, &options)
            .unwrap_err();
        assert!(matches!(err, EtlError::ReferenceNotFound { .. }));
        assert_eq!(store.row("Person", 1).unwrap()["name"], Value::from("Anna"));
    }
}
