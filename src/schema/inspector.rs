//! Schema Inspector: field classification and identity-field discovery.

use crate::error::EtlError;

use super::{EntityTypeDescriptor, FieldDescriptor, SURROGATE_KEY};

/// Fields of an entity type in declaration order.
pub fn fields(descriptor: &EntityTypeDescriptor) -> &[FieldDescriptor] {
    &descriptor.fields
}

/// Names of fields flagged unique, excluding the surrogate key.
pub fn unique_fields(descriptor: &EntityTypeDescriptor) -> Vec<String> {
    descriptor
        .fields
        .iter()
        .filter(|f| f.unique && f.name != SURROGATE_KEY)
        .map(|f| f.name.clone())
        .collect()
}

/// Names of text fields, excluding the engine-managed hash field.
pub fn text_fields(descriptor: &EntityTypeDescriptor) -> Vec<String> {
    descriptor
        .fields
        .iter()
        .filter(|f| f.is_text() && descriptor.hash_field.as_deref() != Some(f.name.as_str()))
        .map(|f| f.name.clone())
        .collect()
}

/// Field(s) usable to resolve a bare value into a full entity.
///
/// In order of preference:
/// 1. the single composite-uniqueness group, if exactly one is declared;
/// 2. the only unique field;
/// 3. a text field called `name`, or else the only text field.
///
/// Anything else is ambiguous and fails with [`EtlError::AmbiguousIdentity`];
/// picking a field arbitrarily would make matches silently wrong.
pub fn unambiguous_identity_fields(descriptor: &EntityTypeDescriptor) -> Result<Vec<String>, EtlError> {
    if let [group] = descriptor.unique_together.as_slice() {
        return Ok(group.clone());
    }

    let unique = unique_fields(descriptor);
    if unique.len() == 1 {
        return Ok(unique);
    }

    let text = text_fields(descriptor);
    if text.iter().any(|name| name == "name") {
        return Ok(vec!["name".to_string()]);
    }
    if text.len() == 1 {
        return Ok(text);
    }

    Err(EtlError::AmbiguousIdentity {
        entity_type: descriptor.name.clone(),
        reason: format!(
            "{} unique-together groups, {} unique fields, {} text fields",
            descriptor.unique_together.len(),
            unique.len(),
            text.len()
        ),
    })
}

/// Single unambiguous field, as needed when a bare scalar stands for an entity.
pub fn single_identity_field(descriptor: &EntityTypeDescriptor) -> Result<String, EtlError> {
    let mut fields = unambiguous_identity_fields(descriptor)?;
    if fields.len() != 1 {
        return Err(EtlError::AmbiguousIdentity {
            entity_type: descriptor.name.clone(),
            reason: format!(
                "identity spans {} fields ({}); a single value cannot fill it",
                fields.len(),
                fields.join(", ")
            ),
        });
    }
    Ok(fields.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityTypeDescriptor, FieldDescriptor};

    #[test]
    fn test_unique_fields() {
        let descriptor = EntityTypeDescriptor::new("TwoUnique")
            .field(FieldDescriptor::text("record").unique())
            .field(FieldDescriptor::text("anotherfield").unique())
            .field(FieldDescriptor::text("name"));

        assert_eq!(unique_fields(&descriptor), vec!["record", "anotherfield"]);
    }

    #[test]
    fn test_composite_group_wins() {
        let descriptor = EntityTypeDescriptor::new("WellDefined")
            .field(FieldDescriptor::text("something"))
            .field(FieldDescriptor::integer("somenumber"))
            .field(FieldDescriptor::text("name"))
            .unique_together(["something", "somenumber"]);

        assert_eq!(
            unambiguous_identity_fields(&descriptor).unwrap(),
            vec!["something", "somenumber"]
        );
        assert!(matches!(
            single_identity_field(&descriptor),
            Err(EtlError::AmbiguousIdentity { .. })
        ));
    }

    #[test]
    fn test_single_unique_field() {
        let descriptor = EntityTypeDescriptor::new("Polish")
            .field(FieldDescriptor::text("record").unique())
            .field(FieldDescriptor::text("ilosc"));

        assert_eq!(unambiguous_identity_fields(&descriptor).unwrap(), vec!["record"]);
    }

    #[test]
    fn test_name_preferred_among_text_fields() {
        let descriptor = EntityTypeDescriptor::new("TestModel")
            .field(FieldDescriptor::text("record"))
            .field(FieldDescriptor::text("name"))
            .field(FieldDescriptor::text("zahl"));

        assert_eq!(single_identity_field(&descriptor).unwrap(), "name");
    }

    #[test]
    fn test_only_text_field() {
        let descriptor = EntityTypeDescriptor::new("Intermediate")
            .field(FieldDescriptor::reference("owner", "Owner"))
            .field(FieldDescriptor::text("attribute"));

        assert_eq!(single_identity_field(&descriptor).unwrap(), "attribute");
    }

    #[test]
    fn test_ambiguous_identity() {
        let descriptor = EntityTypeDescriptor::new("HashTestModel")
            .field(FieldDescriptor::text("record"))
            .field(FieldDescriptor::text("zahl"))
            .field(FieldDescriptor::text("md5"))
            .hash_field("md5");

        let err = unambiguous_identity_fields(&descriptor).unwrap_err();
        assert!(matches!(err, EtlError::AmbiguousIdentity { ref entity_type, .. } if entity_type == "HashTestModel"));
    }

    #[test]
    fn test_hash_field_is_not_an_identity_candidate() {
        let descriptor = EntityTypeDescriptor::new("Hashed")
            .field(FieldDescriptor::text("record"))
            .field(FieldDescriptor::text("md5"))
            .hash_field("md5");

        assert_eq!(single_identity_field(&descriptor).unwrap(), "record");
    }
}
