//! Registry of named record transforms.
//!
//! Transforms are looked up by the names listed under `transform.steps` in
//! the load configuration. A few general-purpose transforms are built in;
//! callers register their own closures for anything domain-specific.

use std::collections::HashMap;

use crate::entity::{Record, Value};

use super::TransformError;

/// A record-to-record transformation step.
pub trait TransformFn: Send + Sync {
    fn execute(&self, record: Record) -> Result<Record, TransformError>;
}

impl<F> TransformFn for F
where
    F: Fn(Record) -> Result<Record, TransformError> + Send + Sync,
{
    fn execute(&self, record: Record) -> Result<Record, TransformError> {
        self(record)
    }
}

/// Registry for storing and calling transformation functions
pub struct TransformRegistry {
    transforms: HashMap<String, Box<dyn TransformFn>>,
}

impl TransformRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Registry holding the built-in transforms.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("trim_whitespace", Box::new(trim_whitespace));
        registry.register("empty_to_null", Box::new(empty_to_null));
        registry.register("lowercase_keys", Box::new(lowercase_keys));
        registry
    }

    /// Register a transformation function
    ///
    /// # Example
    ///
    /// ```ignore
    /// use etl_sync::transform::{TransformError, TransformRegistry};
    ///
    /// let mut registry = TransformRegistry::new();
    /// registry.register("drop_comment", Box::new(|mut record: Record| -> Result<Record, TransformError> {
    ///     record.shift_remove("comment");
    ///     Ok(record)
    /// }));
    /// ```
    pub fn register(&mut self, name: impl Into<String>, func: Box<dyn TransformFn>) {
        self.transforms.insert(name.into(), func);
    }

    /// Run a registered transformation on `record`
    pub fn call(&self, name: &str, record: Record) -> Result<Record, TransformError> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| TransformError::NotFound(name.to_string()))?;

        transform.execute(record)
    }

    /// Check if a transform is registered
    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Sorted names of all registered transforms
    pub fn list_transforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn trim_whitespace(record: Record) -> Result<Record, TransformError> {
    Ok(record
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => (key, Value::String(s.trim().to_string())),
            other => (key, other),
        })
        .collect())
}

fn empty_to_null(record: Record) -> Result<Record, TransformError> {
    Ok(record
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) if s.is_empty() => (key, Value::Null),
            other => (key, other),
        })
        .collect())
}

fn lowercase_keys(record: Record) -> Result<Record, TransformError> {
    let mut out = Record::with_capacity(record.len());
    for (key, value) in record {
        let lowered = key.to_lowercase();
        if out.contains_key(&lowered) {
            return Err(TransformError::Execution(format!(
                "keys collide once lowercased: '{}'",
                lowered
            )));
        }
        out.insert(lowered, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn test_register_and_call_transform() {
        let mut registry = TransformRegistry::new();

        registry.register(
            "uppercase_name",
            Box::new(|mut record: Record| -> Result<Record, TransformError> {
                let name = record
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransformError::InvalidArgs("Missing 'name'".to_string()))?
                    .to_uppercase();
                record.insert("name".to_string(), Value::String(name));
                Ok(record)
            }) as Box<dyn TransformFn>,
        );

        let result = registry.call("uppercase_name", record! { "name" => "ann" }).unwrap();
        assert_eq!(result["name"], Value::from("ANN"));

        let err = registry.call("uppercase_name", record! {}).unwrap_err();
        assert!(matches!(err, TransformError::InvalidArgs(_)));
    }

    #[test]
    fn test_transform_not_found() {
        let registry = TransformRegistry::new();

        let result = registry.call("nonexistent", record! {});

        assert!(matches!(result, Err(TransformError::NotFound(_))));
    }

    #[test]
    fn test_builtins() {
        let registry = TransformRegistry::with_builtins();
        assert_eq!(
            registry.list_transforms(),
            vec!["empty_to_null", "lowercase_keys", "trim_whitespace"]
        );

        let record = registry
            .call("trim_whitespace", record! { "Name" => "  Ann ", "age" => 3 })
            .and_then(|r| registry.call("lowercase_keys", r))
            .unwrap();
        assert_eq!(record["name"], Value::from("Ann"));
        assert_eq!(record["age"], Value::Int(3));

        let record = registry.call("empty_to_null", record! { "zahl" => "" }).unwrap();
        assert_eq!(record["zahl"], Value::Null);
    }

    #[test]
    fn test_lowercase_keys_collision() {
        let registry = TransformRegistry::with_builtins();
        let err = registry
            .call("lowercase_keys", record! { "Name" => "a", "name" => "b" })
            .unwrap_err();
        assert!(matches!(err, TransformError::Execution(_)));
    }
}
