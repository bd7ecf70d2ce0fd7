//! Entity type descriptors.
//!
//! The engine never reflects over Rust types: every storable kind is described
//! by an [`EntityTypeDescriptor`] value, built once at startup (usually from a
//! YAML schema file, see [`loader`]) and treated as immutable configuration.

pub mod inspector;
pub mod loader;

use convert_case::{Case, Casing};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

use crate::error::EtlError;

pub use inspector::{text_fields, unambiguous_identity_fields, unique_fields};
pub use loader::compute_load_order;

/// Storage-assigned primary key present on every entity type.
pub const SURROGATE_KEY: &str = "id";

/// Length of the hex SHA-256 digest written to a hash field.
pub const HASH_LENGTH: usize = 64;

fn default_dim() -> u8 {
    2
}

fn default_to_field() -> String {
    SURROGATE_KEY.to_string()
}

fn default_hash_exclude() -> Vec<String> {
    vec!["last_modified".to_string()]
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse schema: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("entity type '{0}' is defined more than once")]
    DuplicateEntity(String),

    #[error("field '{field}' is defined more than once on {entity}")]
    DuplicateField { entity: String, field: String },

    #[error("{entity} declares a field named 'id', which is reserved for the surrogate key")]
    ReservedField { entity: String },

    #[error("{entity}.{field} refers to undefined entity type '{target}'")]
    UndefinedEntity {
        entity: String,
        field: String,
        target: String,
    },

    #[error("{entity}.{field} targets {target}.{to_field}, which does not exist")]
    UnknownTargetField {
        entity: String,
        field: String,
        target: String,
        to_field: String,
    },

    #[error("{entity}.{field} has an invalid through entity: {reason}")]
    InvalidThrough {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("hash field {entity}.{field} must be a text field")]
    InvalidHashField { entity: String, field: String },

    #[error("hash field {entity}.{field} holds {max_length} characters, the content hash needs {}", HASH_LENGTH)]
    HashFieldTooShort {
        entity: String,
        field: String,
        max_length: usize,
    },

    #[error("{entity} lists unknown field '{field}' in unique_together")]
    UnknownUniqueField { entity: String, field: String },

    #[error("geometry field {entity}.{field} has unsupported dimension {dim}")]
    InvalidDimension { entity: String, field: String, dim: u8 },

    #[error("reference cycle among entity types: {0:?}")]
    ReferenceCycle(Vec<String>),
}

/// Intermediate link entity of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Through {
    /// Link entity type.
    pub entity: String,
    /// Reference field on the link entity pointing at the owner.
    pub source_field: String,
    /// Reference field on the link entity pointing at the related entity.
    pub target_field: String,
}

/// Closed set of field kinds the Value Preparer knows how to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    #[serde(rename = "datetime")]
    DateTime {
        #[serde(default)]
        auto_now: bool,
        #[serde(default)]
        auto_now_add: bool,
    },
    Geometry {
        #[serde(default = "default_dim")]
        dim: u8,
        #[serde(default)]
        srid: Option<i32>,
    },
    /// Single reference (foreign key).
    Reference {
        to: String,
        #[serde(default = "default_to_field")]
        to_field: String,
    },
    /// To-many reference, attached after the owner is committed.
    Collection {
        to: String,
        #[serde(default)]
        through: Option<Through>,
        #[serde(default)]
        join_table: Option<String>,
        #[serde(default)]
        owner_column: Option<String>,
        #[serde(default)]
        target_column: Option<String>,
    },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::DateTime { .. } => "datetime",
            FieldKind::Geometry { .. } => "geometry",
            FieldKind::Reference { .. } => "reference",
            FieldKind::Collection { .. } => "collection",
        }
    }

    /// Related entity type of references and collections.
    pub fn target(&self) -> Option<&str> {
        match self {
            FieldKind::Reference { to, .. } | FieldKind::Collection { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            unique: false,
            max_length: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::DateTime {
                auto_now: false,
                auto_now_add: false,
            },
        )
    }

    pub fn geometry(name: impl Into<String>, dim: u8) -> Self {
        Self::new(name, FieldKind::Geometry { dim, srid: None })
    }

    pub fn reference(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                to: to.into(),
                to_field: default_to_field(),
            },
        )
    }

    pub fn collection(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Collection {
                to: to.into(),
                through: None,
                join_table: None,
                owner_column: None,
                target_column: None,
            },
        )
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Target field of a reference (defaults to the surrogate key).
    pub fn to_field(mut self, field: impl Into<String>) -> Self {
        if let FieldKind::Reference { to_field, .. } = &mut self.kind {
            *to_field = field.into();
        }
        self
    }

    /// Route a collection through an explicit link entity.
    pub fn through(
        mut self,
        entity: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        if let FieldKind::Collection { through, .. } = &mut self.kind {
            *through = Some(Through {
                entity: entity.into(),
                source_field: source_field.into(),
                target_field: target_field.into(),
            });
        }
        self
    }

    /// Mark a datetime as server-assigned on every write.
    pub fn auto_now(mut self) -> Self {
        if let FieldKind::DateTime { auto_now, .. } = &mut self.kind {
            *auto_now = true;
        }
        self
    }

    /// Mark a datetime as server-assigned on creation.
    pub fn auto_now_add(mut self) -> Self {
        if let FieldKind::DateTime { auto_now_add, .. } = &mut self.kind {
            *auto_now_add = true;
        }
        self
    }

    /// Values of auto-managed timestamps never come from input.
    pub fn is_auto_managed(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::DateTime { auto_now, auto_now_add } if auto_now || auto_now_add
        )
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, FieldKind::Collection { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, FieldKind::Text)
    }
}

/// Static schema metadata for one storable kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    /// Composite uniqueness groups.
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    /// Text field receiving the content hash; enables hash identity.
    #[serde(default)]
    pub hash_field: Option<String>,
    /// Fields left out of the content hash besides the key and the hash itself.
    #[serde(default = "default_hash_exclude")]
    pub hash_exclude: Vec<String>,
}

impl EntityTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            fields: Vec::new(),
            unique_together: Vec::new(),
            hash_field: None,
            hash_exclude: default_hash_exclude(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn unique_together<S: Into<String>>(mut self, group: impl IntoIterator<Item = S>) -> Self {
        self.unique_together
            .push(group.into_iter().map(Into::into).collect());
        self
    }

    pub fn hash_field(mut self, field: impl Into<String>) -> Self {
        self.hash_field = Some(field.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Storage table name: explicit, or the snake_case entity name.
    pub fn table_name(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| self.name.to_case(Case::Snake))
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        name == SURROGATE_KEY || self.get_field(name).is_some()
    }

    fn validate_local(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name == SURROGATE_KEY {
                return Err(SchemaError::ReservedField {
                    entity: self.name.clone(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if let FieldKind::Geometry { dim, .. } = field.kind {
                if dim != 2 && dim != 3 {
                    return Err(SchemaError::InvalidDimension {
                        entity: self.name.clone(),
                        field: field.name.clone(),
                        dim,
                    });
                }
            }
        }

        if let Some(hash) = &self.hash_field {
            let Some(field) = self.get_field(hash).filter(|f| f.is_text()) else {
                return Err(SchemaError::InvalidHashField {
                    entity: self.name.clone(),
                    field: hash.clone(),
                });
            };
            if let Some(max_length) = field.max_length.filter(|&max| max < HASH_LENGTH) {
                return Err(SchemaError::HashFieldTooShort {
                    entity: self.name.clone(),
                    field: hash.clone(),
                    max_length,
                });
            }
        }

        for group in &self.unique_together {
            for name in group {
                if !self.has_field(name) {
                    return Err(SchemaError::UnknownUniqueField {
                        entity: self.name.clone(),
                        field: name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Registry of every entity type the engine may touch.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: IndexMap<String, EntityTypeDescriptor>,
}

impl Schema {
    /// Build and validate a schema.
    pub fn new(descriptors: Vec<EntityTypeDescriptor>) -> Result<Self, SchemaError> {
        let mut entities = IndexMap::new();
        for descriptor in descriptors {
            descriptor.validate_local()?;
            if entities.contains_key(&descriptor.name) {
                return Err(SchemaError::DuplicateEntity(descriptor.name));
            }
            entities.insert(descriptor.name.clone(), descriptor);
        }

        let schema = Self { entities };
        schema.validate_relations()?;
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Option<&EntityTypeDescriptor> {
        self.entities.get(name)
    }

    /// Look up a descriptor, failing with [`EtlError::UnknownEntityType`].
    pub fn descriptor(&self, name: &str) -> Result<&EntityTypeDescriptor, EtlError> {
        self.get(name)
            .ok_or_else(|| EtlError::UnknownEntityType(name.to_string()))
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityTypeDescriptor> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn validate_relations(&self) -> Result<(), SchemaError> {
        for descriptor in self.entities.values() {
            for field in &descriptor.fields {
                let Some(target_name) = field.kind.target() else {
                    continue;
                };
                let target = self.get(target_name).ok_or_else(|| SchemaError::UndefinedEntity {
                    entity: descriptor.name.clone(),
                    field: field.name.clone(),
                    target: target_name.to_string(),
                })?;

                match &field.kind {
                    FieldKind::Reference { to_field, .. } => {
                        if !target.has_field(to_field) {
                            return Err(SchemaError::UnknownTargetField {
                                entity: descriptor.name.clone(),
                                field: field.name.clone(),
                                target: target.name.clone(),
                                to_field: to_field.clone(),
                            });
                        }
                    }
                    FieldKind::Collection {
                        through: Some(through),
                        ..
                    } => self.validate_through(descriptor, field, through)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn validate_through(
        &self,
        owner: &EntityTypeDescriptor,
        field: &FieldDescriptor,
        through: &Through,
    ) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidThrough {
            entity: owner.name.clone(),
            field: field.name.clone(),
            reason,
        };

        let link = self
            .get(&through.entity)
            .ok_or_else(|| invalid(format!("'{}' is not defined", through.entity)))?;
        let related = field.kind.target().unwrap_or_default();

        for (link_field, expected) in [
            (&through.source_field, owner.name.as_str()),
            (&through.target_field, related),
        ] {
            match link.get_field(link_field).map(|f| &f.kind) {
                Some(FieldKind::Reference { to, .. }) if to == expected => {}
                _ => {
                    return Err(invalid(format!(
                        "{}.{} must be a reference to {}",
                        link.name, link_field, expected
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new("Person")
            .field(FieldDescriptor::text("name").max_length(10).unique())
            .field(FieldDescriptor::integer("age").nullable())
    }

    #[test]
    fn test_table_name_defaults_to_snake_case() {
        assert_eq!(EntityTypeDescriptor::new("ElNumero").table_name(), "el_numero");
        assert_eq!(
            EntityTypeDescriptor::new("ElNumero").table("numbers").table_name(),
            "numbers"
        );
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let descriptor = person().field(FieldDescriptor::text("name"));
        let err = Schema::new(vec![descriptor]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
    }

    #[test]
    fn test_reserved_id_field_rejected() {
        let descriptor = person().field(FieldDescriptor::integer("id"));
        assert!(matches!(
            Schema::new(vec![descriptor]),
            Err(SchemaError::ReservedField { .. })
        ));
    }

    #[test]
    fn test_undefined_reference_target() {
        let order = EntityTypeDescriptor::new("Order")
            .field(FieldDescriptor::reference("customer", "Customer"));
        let err = Schema::new(vec![order]).unwrap_err();
        assert!(err.to_string().contains("undefined entity type 'Customer'"));
    }

    #[test]
    fn test_reference_to_field_must_exist() {
        let order = EntityTypeDescriptor::new("Order")
            .field(FieldDescriptor::reference("customer", "Person").to_field("email"));
        let err = Schema::new(vec![person(), order]).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTargetField { .. }));
    }

    #[test]
    fn test_through_entity_validated() {
        let tag = EntityTypeDescriptor::new("Tag").field(FieldDescriptor::text("name"));
        let link = EntityTypeDescriptor::new("Tagging")
            .field(FieldDescriptor::reference("person", "Person"))
            .field(FieldDescriptor::text("tag"));
        let owner = person().field(
            FieldDescriptor::collection("tags", "Tag").through("Tagging", "person", "tag"),
        );
        let err = Schema::new(vec![owner, tag, link]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidThrough { .. }));
    }

    #[test]
    fn test_hash_field_must_be_text() {
        let descriptor = person().hash_field("age");
        assert!(matches!(
            Schema::new(vec![descriptor]),
            Err(SchemaError::InvalidHashField { .. })
        ));
    }

    #[test]
    fn test_hash_field_must_fit_digest() {
        let legacy = person()
            .field(FieldDescriptor::text("md5").max_length(32).nullable())
            .hash_field("md5");
        assert!(matches!(
            Schema::new(vec![legacy]),
            Err(SchemaError::HashFieldTooShort { max_length: 32, .. })
        ));

        let descriptor = person()
            .field(FieldDescriptor::text("md5").max_length(HASH_LENGTH).nullable())
            .hash_field("md5");
        assert!(Schema::new(vec![descriptor]).is_ok());
    }

    #[test]
    fn test_auto_managed_datetime() {
        assert!(FieldDescriptor::datetime("last_modified").auto_now().is_auto_managed());
        assert!(FieldDescriptor::datetime("created").auto_now_add().is_auto_managed());
        assert!(!FieldDescriptor::datetime("born").is_auto_managed());
    }

    #[test]
    fn test_descriptor_lookup() {
        let schema = Schema::new(vec![person()]).unwrap();
        assert!(schema.descriptor("Person").is_ok());
        assert!(matches!(
            schema.descriptor("Nobody"),
            Err(EtlError::UnknownEntityType(_))
        ));
    }
}
