//! Relationship Committer.
//!
//! Collection members are reconciled during preparation but linked only
//! once the owner has a stored identity. Relations with a native join table
//! go through [`Storage::add_related`]; relations routed through a link
//! entity reconcile one link record per member, identified by the
//! (owner, member) pair, so resubmitting the same members never duplicates
//! links.

use indexmap::IndexMap;

use crate::entity::{EntityRef, Record, Value};
use crate::error::{EtlError, Result};
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::schema::{EntityTypeDescriptor, FieldKind};
use crate::storage::Storage;

/// A reconciled collection member and the input item it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub entity: EntityRef,
    pub raw: Value,
}

impl Member {
    pub fn new(entity: EntityRef, raw: Value) -> Self {
        Self { entity, raw }
    }
}

/// Collection field name -> reconciled members, in input order.
pub type DeferredSet = IndexMap<String, Vec<Member>>;

impl<'a, S: Storage + ?Sized> Reconciler<'a, S> {
    /// Link every deferred member to `owner`.
    pub fn attach(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        owner: &EntityRef,
        deferred: &DeferredSet,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<()> {
        for (name, members) in deferred {
            if members.is_empty() {
                continue;
            }
            let field = descriptor.get_field(name).ok_or_else(|| EtlError::InvalidInput {
                entity_type: descriptor.name.clone(),
                message: format!("no collection field '{}'", name),
            })?;

            match &field.kind {
                FieldKind::Collection { through: None, .. } => {
                    let related: Vec<EntityRef> = members.iter().map(|m| m.entity.clone()).collect();
                    self.storage
                        .add_related(descriptor, field, owner, &related)
                        .map_err(|e| EtlError::from_storage(&descriptor.name, e))?;
                }
                FieldKind::Collection {
                    through: Some(through),
                    ..
                } => {
                    let schema = self.schema;
                    let link_descriptor = schema.descriptor(&through.entity)?;
                    let link_options = options.for_link(&through.source_field, &through.target_field);
                    for member in members {
                        let mut link = link_attributes(link_descriptor, &member.raw);
                        link.insert(through.source_field.clone(), Value::Entity(owner.clone()));
                        link.insert(through.target_field.clone(), Value::Entity(member.entity.clone()));

                        let result =
                            self.reconcile(&through.entity, &Value::Dict(link), &link_options, depth + 1)?;
                        if let Some(rejection) = result.rejection {
                            return Err(EtlError::StorageConstraint {
                                entity_type: through.entity.clone(),
                                message: rejection.reason.to_string(),
                            });
                        }
                    }
                }
                _ => {
                    return Err(EtlError::InvalidInput {
                        entity_type: descriptor.name.clone(),
                        message: format!("{} is not a collection", name),
                    })
                }
            }

            tracing::debug!(
                owner = %owner,
                field = %name,
                members = members.len(),
                "Attached related entities"
            );
        }
        Ok(())
    }
}

/// Keys of a member's input dictionary that are scalar fields of the link entity.
fn link_attributes(link: &EntityTypeDescriptor, raw: &Value) -> Record {
    let Value::Dict(item) = raw else {
        return Record::new();
    };
    item.iter()
        .filter(|(key, _)| {
            link.get_field(key)
                .is_some_and(|f| !matches!(f.kind, FieldKind::Reference { .. } | FieldKind::Collection { .. }))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
