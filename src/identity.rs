//! Identity Resolver.
//!
//! Decides which fields identify a candidate record in storage and builds
//! the existence query from its prepared values.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::entity::{Record, Value};
use crate::error::{EtlError, Result};
use crate::reconcile::ReconcileOptions;
use crate::schema::{inspector, EntityTypeDescriptor, FieldKind, SURROGATE_KEY};
use crate::storage::Query;

/// Where a persistence criterion came from, in order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionSource {
    /// `etl_persistence` control key of the record.
    Record,
    /// Engine options of the call.
    Options,
    /// Fields the schema flags unique.
    UniqueFields,
    /// The descriptor's content-hash field.
    Hash,
    /// Nothing identifies the record; it is always new.
    None,
}

/// Ordered field names whose combined values identify a stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceCriterion {
    pub fields: Vec<String>,
    pub source: CriterionSource,
}

impl PersistenceCriterion {
    pub fn none() -> Self {
        Self {
            fields: Vec::new(),
            source: CriterionSource::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Existence query over the prepared values.
    ///
    /// Fields whose value is absent, null or empty are left out of the
    /// query. `None` means no field carries a value and the candidate is new.
    pub fn query(&self, values: &Record) -> Option<Query> {
        let query = self
            .fields
            .iter()
            .filter_map(|name| {
                values
                    .get(name)
                    .filter(|v| !v.is_blank())
                    .map(|v| (name, v.clone()))
            })
            .fold(Query::new(), |q, (name, v)| q.eq(name.clone(), v));
        (!query.is_empty()).then_some(query)
    }
}

impl fmt::Display for PersistenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", self.fields.join(", "))
        }
    }
}

/// Resolve the persistence criterion of a record.
///
/// Precedence: the record's own override, the call options, the schema's
/// unique fields, and finally the hash field when hashing is enabled.
/// Explicit criteria must name fields of the entity type.
pub fn resolve(
    descriptor: &EntityTypeDescriptor,
    record_override: Option<&[String]>,
    options: &ReconcileOptions,
) -> Result<PersistenceCriterion> {
    let explicit = [
        (record_override, CriterionSource::Record),
        (options.persistence.as_deref(), CriterionSource::Options),
    ];
    for (fields, source) in explicit {
        let Some(fields) = fields.filter(|f| !f.is_empty()) else {
            continue;
        };
        check_fields(descriptor, fields)?;
        return Ok(PersistenceCriterion {
            fields: fields.to_vec(),
            source,
        });
    }

    let unique = inspector::unique_fields(descriptor);
    if !unique.is_empty() {
        return Ok(PersistenceCriterion {
            fields: unique,
            source: CriterionSource::UniqueFields,
        });
    }

    match hash_field(descriptor, options) {
        Some(field) => Ok(PersistenceCriterion {
            fields: vec![field.to_string()],
            source: CriterionSource::Hash,
        }),
        None => Ok(PersistenceCriterion::none()),
    }
}

fn check_fields(descriptor: &EntityTypeDescriptor, fields: &[String]) -> Result<()> {
    for name in fields {
        let usable = name == SURROGATE_KEY
            || descriptor
                .get_field(name)
                .map_or(false, |f| !f.is_collection());
        if !usable {
            return Err(EtlError::InvalidInput {
                entity_type: descriptor.name.clone(),
                message: format!("persistence field '{}' is not a field of {}", name, descriptor.name),
            });
        }
    }
    Ok(())
}

/// Hash field in effect for this call, if any.
pub fn hash_field<'d>(descriptor: &'d EntityTypeDescriptor, options: &ReconcileOptions) -> Option<&'d str> {
    if options.hash {
        descriptor.hash_field.as_deref()
    } else {
        None
    }
}

/// SHA-256 over the record's hashable fields.
///
/// Every scalar and single-reference field takes part, sorted by name,
/// except the surrogate key, the hash field and `hash_exclude`. Absent
/// values hash as the empty string; references hash as the referenced id.
pub fn content_hash(descriptor: &EntityTypeDescriptor, values: &Record) -> String {
    let mut names: Vec<&str> = descriptor
        .fields
        .iter()
        .filter(|f| !matches!(f.kind, FieldKind::Collection { .. }))
        .map(|f| f.name.as_str())
        .filter(|name| {
            *name != SURROGATE_KEY
                && descriptor.hash_field.as_deref() != Some(*name)
                && !descriptor.hash_exclude.iter().any(|e| e == name)
        })
        .collect();
    names.sort_unstable();

    let mut hasher = Sha256::new();
    for name in names {
        let text = values.get(name).and_then(Value::to_text).unwrap_or_default();
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(text.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::record;
    use crate::schema::FieldDescriptor;

    fn hashed() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new("HashTestModel")
            .field(FieldDescriptor::text("record"))
            .field(FieldDescriptor::text("zahl"))
            .field(FieldDescriptor::text("comment").nullable())
            .field(FieldDescriptor::text("md5").nullable())
            .field(FieldDescriptor::datetime("last_modified").auto_now())
            .hash_field("md5")
    }

    #[test]
    fn test_precedence() {
        let descriptor = EntityTypeDescriptor::new("TestModel")
            .field(FieldDescriptor::text("record").unique())
            .field(FieldDescriptor::text("name"));
        let options = ReconcileOptions::default().with_persistence(["name"]);

        let override_fields = vec!["record".to_string(), "name".to_string()];
        let criterion = resolve(&descriptor, Some(override_fields.as_slice()), &options).unwrap();
        assert_eq!(criterion.source, CriterionSource::Record);
        assert_eq!(criterion.fields, override_fields);

        let criterion = resolve(&descriptor, None, &options).unwrap();
        assert_eq!(criterion.source, CriterionSource::Options);
        assert_eq!(criterion.fields, vec!["name"]);

        let criterion = resolve(&descriptor, Some(Vec::new().as_slice()), &ReconcileOptions::default()).unwrap();
        assert_eq!(criterion.source, CriterionSource::UniqueFields);
        assert_eq!(criterion.fields, vec!["record"]);
    }

    #[test]
    fn test_hash_is_the_fallback() {
        let criterion = resolve(&hashed(), None, &ReconcileOptions::default()).unwrap();
        assert_eq!(criterion.source, CriterionSource::Hash);
        assert_eq!(criterion.fields, vec!["md5"]);

        let options = ReconcileOptions {
            hash: false,
            ..ReconcileOptions::default()
        };
        let criterion = resolve(&hashed(), None, &options).unwrap();
        assert!(criterion.is_empty());
        assert_eq!(criterion.query(&record! { "record" => "1" }), None);
    }

    #[test]
    fn test_unknown_persistence_field() {
        let options = ReconcileOptions::default().with_persistence(["nope"]);
        let err = resolve(&hashed(), None, &options).unwrap_err();
        assert!(matches!(err, EtlError::InvalidInput { .. }));
    }

    #[test]
    fn test_query_skips_blank_values() {
        let criterion = PersistenceCriterion {
            fields: vec!["record".to_string(), "zahl".to_string()],
            source: CriterionSource::Options,
        };

        let query = criterion
            .query(&record! { "record" => "A1", "zahl" => "" })
            .unwrap();
        assert_eq!(query.fields(), vec!["record"]);

        assert_eq!(criterion.query(&record! { "record" => Value::Null }), None);
    }

    #[test]
    fn test_content_hash_ignores_excluded_fields() {
        let descriptor = hashed();
        let a = content_hash(&descriptor, &record! { "record" => "1", "zahl" => "x" });
        let b = content_hash(
            &descriptor,
            &record! { "zahl" => "x", "record" => "1", "md5" => "stale", "last_modified" => "2020-01-01" },
        );
        let c = content_hash(&descriptor, &record! { "record" => "1", "zahl" => "y" });

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_hash_uses_reference_ids() {
        let descriptor = EntityTypeDescriptor::new("Order")
            .field(FieldDescriptor::text("record"))
            .field(FieldDescriptor::reference("customer", "Person"));

        let by_ref = content_hash(
            &descriptor,
            &record! { "record" => "1", "customer" => EntityRef::new("Person", 7) },
        );
        let by_text = content_hash(&descriptor, &record! { "record" => "1", "customer" => "7" });
        assert_eq!(by_ref, by_text);
    }
}
