//! Value Preparer.
//!
//! Turns a raw input record into storage-ready values, one field kind at a
//! time. Fields absent from the input are never invented: a partial record
//! prepares into a partial value map, so updates stay partial merges.
//!
//! Reference fields are resolved by recursing into the reconciler through
//! [`ReferenceResolver`]; collection members are resolved the same way but
//! parked in the [`DeferredSet`] until the owner has an identity.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::entity::{EntityRef, Record, Value};
use crate::error::{EtlError, Result};
use crate::geometry::Geometry;
use crate::reconcile::ReconcileOptions;
use crate::relations::{DeferredSet, Member};
use crate::schema::{EntityTypeDescriptor, FieldDescriptor, FieldKind};

/// Raw values counted as `true` for boolean fields.
const TRUTHY: &[&str] = &["1", "True", "true", "t"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

/// Recursive entry points used for reference and collection fields.
pub trait ReferenceResolver {
    /// Resolve a single-reference field value into `Value::Entity` (or `Value::Null`).
    fn resolve_reference(
        &mut self,
        field: &FieldDescriptor,
        raw: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<Value>;

    /// Reconcile one collection member.
    fn resolve_member(
        &mut self,
        field: &FieldDescriptor,
        item: &Value,
        options: &ReconcileOptions,
        depth: usize,
    ) -> Result<EntityRef>;
}

/// Output of [`prepare`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Prepared {
    /// Storage-ready values of scalar and single-reference fields.
    pub values: Record,
    /// Collection members awaiting the owner's identity.
    pub deferred: DeferredSet,
}

/// Prepare every field of `input` known to `descriptor`.
pub fn prepare<R: ReferenceResolver + ?Sized>(
    descriptor: &EntityTypeDescriptor,
    input: &Record,
    options: &ReconcileOptions,
    resolver: &mut R,
    depth: usize,
) -> Result<Prepared> {
    let mut prepared = Prepared::default();

    for key in input.keys() {
        if !descriptor.has_field(key) {
            tracing::debug!(entity = %descriptor.name, field = %key, "Ignoring unknown field");
        }
    }

    for field in &descriptor.fields {
        let Some(raw) = input.get(&field.name) else {
            continue;
        };

        let value = match &field.kind {
            FieldKind::Text => Some(prepare_text(descriptor, field, raw, options)?),
            FieldKind::Integer => {
                let value = coerce_integer(raw).map(Value::Int);
                if value.is_none() {
                    tracing::debug!(entity = %descriptor.name, field = %field.name, raw = %raw, "Omitting non-integer value");
                }
                value
            }
            FieldKind::Float => {
                let value = coerce_float(raw).map(Value::Float);
                if value.is_none() {
                    tracing::debug!(entity = %descriptor.name, field = %field.name, raw = %raw, "Omitting non-numeric value");
                }
                value
            }
            FieldKind::Boolean => Some(Value::Bool(is_truthy(raw))),
            FieldKind::DateTime { .. } if field.is_auto_managed() => None,
            FieldKind::DateTime { .. } => Some(prepare_datetime(descriptor, field, raw)?),
            FieldKind::Geometry { dim, srid } => Some(prepare_geometry(
                descriptor, field, raw, *dim, *srid, options,
            )?),
            FieldKind::Reference { .. } => {
                Some(resolver.resolve_reference(field, raw, options, depth)?)
            }
            FieldKind::Collection { .. } => {
                let items: &[Value] = match raw {
                    Value::Null => &[],
                    Value::List(items) => items,
                    single => std::slice::from_ref(single),
                };
                let mut members = Vec::with_capacity(items.len());
                for item in items {
                    let entity = resolver.resolve_member(field, item, options, depth)?;
                    members.push(Member::new(entity, item.clone()));
                }
                prepared.deferred.insert(field.name.clone(), members);
                None
            }
        };

        if let Some(value) = value {
            prepared.values.insert(field.name.clone(), value);
        }
    }

    Ok(prepared)
}

/// Legacy truthiness: `1`, `"1"`, `"True"`, `"true"`, `"t"` and `true`.
pub fn is_truthy(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::Int(i) => *i == 1,
        Value::String(s) => TRUTHY.contains(&s.as_str()),
        _ => false,
    }
}

/// Parse the date and datetime notations found in source files.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn prepare_text(
    descriptor: &EntityTypeDescriptor,
    field: &FieldDescriptor,
    raw: &Value,
    options: &ReconcileOptions,
) -> Result<Value> {
    let text = match raw {
        Value::Null => return Ok(Value::Null),
        Value::List(_) | Value::Dict(_) => {
            return Err(EtlError::validation(
                &descriptor.name,
                &field.name,
                format!("cannot store a {} as text", raw.type_name()),
            ))
        }
        other => other.to_text().unwrap_or_default(),
    };

    match field.max_length {
        Some(max) if text.chars().count() > max => {
            if !options.truncate_on_overflow {
                return Err(EtlError::validation(
                    &descriptor.name,
                    &field.name,
                    format!("{} characters exceed the maximum of {}", text.chars().count(), max),
                ));
            }
            tracing::debug!(entity = %descriptor.name, field = %field.name, max, "Truncating text");
            Ok(Value::String(text.chars().take(max).collect()))
        }
        _ => Ok(Value::String(text)),
    }
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive.
    let whole = |f: f64| {
        (f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
    };
    match raw {
        Value::Int(i) => Some(*i),
        Value::Float(f) => whole(*f),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    }
}

fn coerce_float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Value of a blank input: null where allowed, an error where required.
fn blank(descriptor: &EntityTypeDescriptor, field: &FieldDescriptor) -> Result<Value> {
    if field.nullable {
        Ok(Value::Null)
    } else {
        Err(EtlError::validation(&descriptor.name, &field.name, "a value is required"))
    }
}

fn prepare_datetime(
    descriptor: &EntityTypeDescriptor,
    field: &FieldDescriptor,
    raw: &Value,
) -> Result<Value> {
    match raw {
        Value::DateTime(dt) => Ok(Value::DateTime(*dt)),
        Value::Null => blank(descriptor, field),
        Value::String(s) if s.trim().is_empty() => blank(descriptor, field),
        Value::String(s) => parse_datetime(s).map(Value::DateTime).ok_or_else(|| {
            EtlError::validation(&descriptor.name, &field.name, format!("unparsable datetime '{}'", s))
        }),
        other => Err(EtlError::validation(
            &descriptor.name,
            &field.name,
            format!("expected a datetime, got a {}", other.type_name()),
        )),
    }
}

fn prepare_geometry(
    descriptor: &EntityTypeDescriptor,
    field: &FieldDescriptor,
    raw: &Value,
    dim: u8,
    srid: Option<i32>,
    options: &ReconcileOptions,
) -> Result<Value> {
    let invalid = |message: String| EtlError::validation(&descriptor.name, &field.name, message);

    let geometry = match raw {
        Value::Geometry(g) => g.clone(),
        Value::String(s) if s.trim().is_empty() => return blank(descriptor, field),
        Value::String(s) => Geometry::from_wkt(s).map_err(|e| invalid(e.to_string()))?,
        Value::Dict(_) => {
            let json = serde_json::to_value(raw).map_err(|e| invalid(e.to_string()))?;
            Geometry::from_geojson(&json).map_err(|e| invalid(e.to_string()))?
        }
        Value::Null => return blank(descriptor, field),
        other => return Err(invalid(format!("expected a geometry, got a {}", other.type_name()))),
    };

    let geometry = match (geometry.srid(), srid) {
        (None, Some(_)) => geometry.with_srid(srid),
        _ => geometry,
    };

    if dim == 2 && geometry.has_z() {
        if !options.reduce_geometry_dimension {
            return Err(invalid(format!(
                "{} geometry does not fit a 2-dimensional field",
                geometry.kind()
            )));
        }
        tracing::debug!(entity = %descriptor.name, field = %field.name, "Dropping Z dimension");
        return Ok(Value::Geometry(geometry.to_2d()));
    }

    Ok(Value::Geometry(geometry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    /// Resolves every reference to id 1 of the target type.
    struct FixedResolver;

    impl ReferenceResolver for FixedResolver {
        fn resolve_reference(
            &mut self,
            field: &FieldDescriptor,
            raw: &Value,
            _options: &ReconcileOptions,
            _depth: usize,
        ) -> Result<Value> {
            if raw.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Entity(EntityRef::new(field.kind.target().unwrap_or_default(), 1)))
        }

        fn resolve_member(
            &mut self,
            field: &FieldDescriptor,
            item: &Value,
            _options: &ReconcileOptions,
            _depth: usize,
        ) -> Result<EntityRef> {
            let id = match item {
                Value::Int(i) => *i,
                _ => 1,
            };
            Ok(EntityRef::new(field.kind.target().unwrap_or_default(), id))
        }
    }

    fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new("TestModel")
            .field(FieldDescriptor::text("record").max_length(10))
            .field(FieldDescriptor::integer("zahl").nullable())
            .field(FieldDescriptor::float("score").nullable())
            .field(FieldDescriptor::boolean("active"))
            .field(FieldDescriptor::datetime("born").nullable())
            .field(FieldDescriptor::datetime("due"))
            .field(FieldDescriptor::datetime("last_modified").auto_now())
            .field(FieldDescriptor::geometry("location", 2).nullable())
            .field(FieldDescriptor::reference("owner", "Person").nullable())
            .field(FieldDescriptor::collection("tags", "Tag"))
    }

    fn run(input: Record) -> Result<Prepared> {
        prepare(&descriptor(), &input, &ReconcileOptions::default(), &mut FixedResolver, 0)
    }

    #[test]
    fn test_absent_fields_are_not_included() {
        let prepared = run(record! { "record" => "A1" }).unwrap();
        assert_eq!(prepared.values.keys().collect::<Vec<_>>(), vec!["record"]);
        assert!(prepared.deferred.is_empty());
    }

    #[test]
    fn test_text_is_stringified_and_truncated() {
        let prepared = run(record! { "record" => 12345 }).unwrap();
        assert_eq!(prepared.values["record"], Value::from("12345"));

        let prepared = run(record! { "record" => "abcdefghijklmnop" }).unwrap();
        assert_eq!(prepared.values["record"], Value::from("abcdefghij"));
    }

    #[test]
    fn test_truncation_can_be_refused() {
        let options = ReconcileOptions {
            truncate_on_overflow: false,
            ..ReconcileOptions::default()
        };
        let err = prepare(
            &descriptor(),
            &record! { "record" => "abcdefghijklmnop" },
            &options,
            &mut FixedResolver,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, EtlError::Validation { ref field, .. } if field == "record"));
    }

    #[test]
    fn test_truncation_counts_characters() {
        let prepared = run(record! { "record" => "ąęćźżółńśąęć" }).unwrap();
        assert_eq!(prepared.values["record"], Value::from("ąęćźżółńśą"));
    }

    #[test]
    fn test_numeric_coercion_omits_bad_values() {
        let prepared = run(record! { "zahl" => "42", "score" => "1.5" }).unwrap();
        assert_eq!(prepared.values["zahl"], Value::Int(42));
        assert_eq!(prepared.values["score"], Value::Float(1.5));

        let prepared = run(record! { "zahl" => "forty-two", "score" => "" }).unwrap();
        assert!(!prepared.values.contains_key("zahl"));
        assert!(!prepared.values.contains_key("score"));

        let prepared = run(record! { "zahl" => "4.0" }).unwrap();
        assert_eq!(prepared.values["zahl"], Value::Int(4));
        for huge in [Value::from("1e30"), Value::Float(-1e19), Value::Float(9_223_372_036_854_775_808.0)] {
            let prepared = run(record! { "zahl" => huge }).unwrap();
            assert!(!prepared.values.contains_key("zahl"));
        }
    }

    #[test]
    fn test_boolean_truthiness() {
        for raw in [Value::from("1"), Value::from("True"), Value::from("t"), Value::Int(1), Value::Bool(true)] {
            assert!(is_truthy(&raw), "{raw:?} should be true");
        }
        for raw in [Value::from("yes"), Value::from("0"), Value::from(""), Value::Int(2), Value::Null] {
            assert!(!is_truthy(&raw), "{raw:?} should be false");
        }
        let prepared = run(record! { "active" => "no" }).unwrap();
        assert_eq!(prepared.values["active"], Value::Bool(false));
    }

    #[test]
    fn test_datetime_parsing() {
        let prepared = run(record! { "born" => "2021-03-04 05:06:07", "due" => "04.03.2021" }).unwrap();
        let Value::DateTime(born) = prepared.values["born"] else {
            panic!("expected a datetime");
        };
        assert_eq!(born.to_string(), "2021-03-04 05:06:07");
        let Value::DateTime(due) = prepared.values["due"] else {
            panic!("expected a datetime");
        };
        assert_eq!(due.to_string(), "2021-03-04 00:00:00");
    }

    #[test]
    fn test_datetime_required_and_optional() {
        let prepared = run(record! { "born" => "" }).unwrap();
        assert_eq!(prepared.values["born"], Value::Null);

        let err = run(record! { "due" => "" }).unwrap_err();
        assert!(matches!(err, EtlError::Validation { ref field, .. } if field == "due"));

        let err = run(record! { "born" => "yesterday" }).unwrap_err();
        assert!(err.to_string().contains("unparsable datetime"));
    }

    #[test]
    fn test_auto_managed_fields_skipped() {
        let prepared = run(record! { "last_modified" => "2021-03-04 05:06:07" }).unwrap();
        assert!(prepared.values.is_empty());
    }

    #[test]
    fn test_geometry_dimension_reduced() {
        let prepared = run(record! { "location" => "POINT Z (1 2 3)" }).unwrap();
        let Value::Geometry(g) = &prepared.values["location"] else {
            panic!("expected a geometry");
        };
        assert!(!g.has_z());
        assert_eq!(g.to_wkt(), "POINT (1 2)");

        let options = ReconcileOptions {
            reduce_geometry_dimension: false,
            ..ReconcileOptions::default()
        };
        let err = prepare(
            &descriptor(),
            &record! { "location" => "POINT Z (1 2 3)" },
            &options,
            &mut FixedResolver,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, EtlError::Validation { .. }));
    }

    #[test]
    fn test_invalid_geometry() {
        let err = run(record! { "location" => "POINT (1" }).unwrap_err();
        assert!(matches!(err, EtlError::Validation { ref field, .. } if field == "location"));
    }

    #[test]
    fn test_references_and_collections() {
        let prepared = run(record! {
            "owner" => "Ann",
            "tags" => vec![Value::Int(3), Value::Int(4)],
        })
        .unwrap();
        assert_eq!(prepared.values["owner"], Value::Entity(EntityRef::new("Person", 1)));
        assert!(!prepared.values.contains_key("tags"));
        assert_eq!(
            prepared.deferred["tags"],
            vec![
                Member::new(EntityRef::new("Tag", 3), Value::Int(3)),
                Member::new(EntityRef::new("Tag", 4), Value::Int(4)),
            ]
        );
    }
}
