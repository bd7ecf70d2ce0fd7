//! Schema file loading and reference-dependency ordering.
//!
//! Loads entity type descriptors from YAML and computes the order in which
//! entity types can be populated using topological sort (Kahn's algorithm).

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use super::{EntityTypeDescriptor, FieldKind, Schema, SchemaError};

#[derive(Deserialize)]
struct SchemaFile {
    entities: Vec<EntityTypeDescriptor>,
}

impl Schema {
    /// Load and validate a schema from a YAML file.
    ///
    /// # Example
    /// ```ignore
    /// use etl_sync::Schema;
    ///
    /// let schema = Schema::load_from_file("config/schema.yaml")?;
    /// println!("Load order: {:?}", schema.load_order()?);
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a schema from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_yaml::from_str(yaml)?;
        Schema::new(file.entities)
    }

    /// Entity types ordered so that referenced types come first.
    pub fn load_order(&self) -> Result<Vec<String>, SchemaError> {
        compute_load_order(self)
    }
}

/// Entity types a descriptor depends on: reference and collection targets,
/// self references excluded.
fn dependencies(descriptor: &EntityTypeDescriptor) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for field in &descriptor.fields {
        let target = match &field.kind {
            FieldKind::Reference { to, .. } | FieldKind::Collection { to, .. } => to,
            _ => continue,
        };
        if target != &descriptor.name && !deps.contains(target) {
            deps.push(target.clone());
        }
    }
    deps
}

/// Compute the population order of entity types (Kahn's algorithm).
///
/// Entity types are sorted so that every reference target precedes the types
/// referring to it. A cycle is reported with the entity types involved; the
/// reconciler itself copes with cycles through its depth guard, so callers
/// may treat this as a warning.
pub fn compute_load_order(schema: &Schema) -> Result<Vec<String>, SchemaError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<&str>> = HashMap::new();

    for descriptor in schema.iter() {
        let deps = dependencies(descriptor);
        in_degree.insert(descriptor.name.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(descriptor.name.as_str());
        }
    }

    // Declaration order keeps the result deterministic.
    let mut queue: VecDeque<&str> = schema
        .iter()
        .map(|d| d.name.as_str())
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();

    let mut sorted = Vec::new();
    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_string());

        if let Some(children) = dependents.get(name) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    if sorted.len() != schema.len() {
        let unprocessed = schema
            .entity_names()
            .into_iter()
            .filter(|name| !sorted.iter().any(|s| s.as_str() == *name))
            .map(str::to_string)
            .collect();
        return Err(SchemaError::ReferenceCycle(unprocessed));
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, FieldKind};

    const SCHEMA: &str = r#"
entities:
  - name: Order
    fields:
      - { name: record, type: text, max_length: 10, unique: true }
      - { name: customer, type: reference, to: Person, to_field: name }
      - { name: placed, type: datetime, nullable: true }
      - { name: items, type: collection, to: Item }
  - name: Person
    hash_field: md5
    fields:
      - { name: name, type: text, max_length: 10, unique: true }
      - { name: md5, type: text, max_length: 64, nullable: true }
      - { name: home, type: geometry }
  - name: Item
    table: items
    fields:
      - { name: sku, type: text, unique: true }
"#;

    #[test]
    fn test_from_yaml_str() {
        let schema = Schema::from_yaml_str(SCHEMA).unwrap();

        assert_eq!(schema.len(), 3);
        let order = schema.get("Order").unwrap();
        assert_eq!(
            order.get_field("customer").unwrap().kind,
            FieldKind::Reference {
                to: "Person".to_string(),
                to_field: "name".to_string()
            }
        );
        assert_eq!(order.get_field("record").unwrap().max_length, Some(10));
        assert!(order.get_field("placed").unwrap().nullable);

        let person = schema.get("Person").unwrap();
        assert_eq!(person.hash_field.as_deref(), Some("md5"));
        assert_eq!(person.hash_exclude, vec!["last_modified"]);
        assert_eq!(
            person.get_field("home").unwrap().kind,
            FieldKind::Geometry { dim: 2, srid: None }
        );
        assert_eq!(schema.get("Item").unwrap().table_name(), "items");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yaml");
        fs::write(&path, SCHEMA).unwrap();

        let schema = Schema::load_from_file(&path).unwrap();
        assert_eq!(schema.entity_names(), vec!["Order", "Person", "Item"]);
    }

    #[test]
    fn test_missing_file() {
        let err = Schema::load_from_file("/nonexistent/schema.yaml").unwrap_err();
        assert!(matches!(err, SchemaError::Io { .. }));
    }

    #[test]
    fn test_load_order_references_first() {
        let schema = Schema::from_yaml_str(SCHEMA).unwrap();
        let order = schema.load_order().unwrap();

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("Person") < pos("Order"));
        assert!(pos("Item") < pos("Order"));
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let node = EntityTypeDescriptor::new("Node")
            .field(FieldDescriptor::text("name"))
            .field(FieldDescriptor::reference("parent", "Node").nullable());
        let schema = Schema::new(vec![node]).unwrap();

        assert_eq!(schema.load_order().unwrap(), vec!["Node"]);
    }

    #[test]
    fn test_reference_cycle_reported() {
        let a = EntityTypeDescriptor::new("A").field(FieldDescriptor::reference("b", "B"));
        let b = EntityTypeDescriptor::new("B").field(FieldDescriptor::reference("a", "A"));
        let schema = Schema::new(vec![a, b]).unwrap();

        let err = schema.load_order().unwrap_err();
        assert!(matches!(err, SchemaError::ReferenceCycle(ref names) if names.len() == 2));
    }
}
