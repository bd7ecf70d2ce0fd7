//! Transformation between extraction and loading.
//!
//! Runs, in order: key remapping, defaults, registered transform steps and
//! validation (required fields, blacklist patterns). The output is the
//! record handed to the reconciler.

pub mod registry;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{Record, Value};

pub use registry::{TransformFn, TransformRegistry};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("required field '{0}' is missing or empty")]
    MissingField(String),

    #[error("value of '{field}' matches blacklist pattern '{pattern}'")]
    Blacklisted { field: String, pattern: String },

    #[error("invalid blacklist pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// `transform` section of the load configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Target key -> source key.
    #[serde(default)]
    pub mappings: IndexMap<String, String>,
    /// Values used where the input has no such key.
    #[serde(default)]
    pub defaults: IndexMap<String, serde_json::Value>,
    /// Registered transforms to apply, in order.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    /// Field -> patterns rejecting the record when the value matches.
    #[serde(default)]
    pub blacklist: IndexMap<String, Vec<String>>,
}

pub struct Transformer {
    mappings: IndexMap<String, String>,
    defaults: Record,
    steps: Vec<String>,
    required: Vec<String>,
    blacklist: Vec<(String, Regex)>,
    registry: TransformRegistry,
}

impl Transformer {
    /// Build a transformer using the built-in registry.
    pub fn from_config(config: &TransformConfig) -> Result<Self, TransformError> {
        Self::with_registry(config, TransformRegistry::with_builtins())
    }

    /// Build a transformer, checking that every step is registered.
    pub fn with_registry(
        config: &TransformConfig,
        registry: TransformRegistry,
    ) -> Result<Self, TransformError> {
        if let Some(missing) = config.steps.iter().find(|s| !registry.has_transform(s)) {
            return Err(TransformError::NotFound(missing.clone()));
        }

        let mut blacklist = Vec::new();
        for (field, patterns) in &config.blacklist {
            for pattern in patterns {
                let regex = Regex::new(pattern).map_err(|source| TransformError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
                blacklist.push((field.clone(), regex));
            }
        }

        Ok(Self {
            mappings: config.mappings.clone(),
            defaults: config
                .defaults
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
            steps: config.steps.clone(),
            required: config.required.clone(),
            blacklist,
            registry,
        })
    }

    /// Rename keys according to the mappings; other keys pass unchanged.
    pub fn remap(&self, mut record: Record) -> Record {
        for (target, source) in &self.mappings {
            if let Some(value) = record.shift_remove(source) {
                record.insert(target.clone(), value);
            }
        }
        record
    }

    /// Fill in defaults for keys the input lacks.
    pub fn apply_defaults(&self, mut record: Record) -> Record {
        for (key, value) in &self.defaults {
            if !record.contains_key(key) {
                record.insert(key.clone(), value.clone());
            }
        }
        record
    }

    pub fn validate(&self, record: &Record) -> Result<(), TransformError> {
        for field in &self.required {
            if record.get(field).map_or(true, Value::is_blank) {
                return Err(TransformError::MissingField(field.clone()));
            }
        }

        for (field, regex) in &self.blacklist {
            let Some(text) = record.get(field).and_then(Value::to_text) else {
                continue;
            };
            if regex.is_match(&text) {
                return Err(TransformError::Blacklisted {
                    field: field.clone(),
                    pattern: regex.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Run every step in order.
    pub fn transform(&self, record: Record) -> Result<Record, TransformError> {
        let record = self.apply_defaults(self.remap(record));
        let record = self
            .steps
            .iter()
            .try_fold(record, |record, step| self.registry.call(step, record))?;
        self.validate(&record)?;
        Ok(record)
    }
}
