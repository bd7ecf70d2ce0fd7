//! Load configuration.
//!
//! One YAML file describes a load: the schema, the target entity type,
//! engine options, reader and transformation settings, and the database.
//! `DATABASE_URL` and `ETL_FEEDBACK` from the environment (or a `.env`
//! file, loaded by the CLI through `dotenv`) override the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::reader::ReaderConfig;
use crate::reconcile::ReconcileOptions;
use crate::transform::TransformConfig;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_FEEDBACK: &str = "ETL_FEEDBACK";

/// Records between two progress messages.
pub const DEFAULT_FEEDBACK_SIZE: usize = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_feedback_size() -> usize {
    DEFAULT_FEEDBACK_SIZE
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: None,
            max_connections: 4,          // One loader connection plus headroom
            min_idle: 1,
            connection_timeout_secs: 30, // Wait up to 30s for connection
            idle_timeout_secs: 600,      // Close idle connections after 10 min
            max_lifetime_secs: 1800,     // Recycle connections after 30 min
        }
    }
}

/// Settings of one load run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Schema file describing every entity type.
    pub schema: PathBuf,
    /// Entity type the source records load into.
    pub entity: String,
    /// Treat identity and reference errors as fatal for the whole batch.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_feedback_size")]
    pub feedback_size: usize,
    /// First record (1-based) to load.
    #[serde(default)]
    pub slice_begin: Option<u64>,
    /// Last record (1-based, inclusive) to load.
    #[serde(default)]
    pub slice_end: Option<u64>,
    /// Log file; defaults to `<source>.<YYYY-MM-DD>.log`.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    /// NDJSON file receiving rejected records.
    #[serde(default)]
    pub reject_file: Option<PathBuf>,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub engine: ReconcileOptions,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl LoadConfig {
    /// Minimal configuration for `entity` of the schema at `schema`.
    pub fn new(schema: impl Into<PathBuf>, entity: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            entity: entity.into(),
            strict: false,
            feedback_size: DEFAULT_FEEDBACK_SIZE,
            slice_begin: None,
            slice_end: None,
            logfile: None,
            reject_file: None,
            reader: ReaderConfig::default(),
            transform: TransformConfig::default(),
            engine: ReconcileOptions::default(),
            database: DatabaseConfig::default(),
        }
    }

    /// Load and validate a configuration file.
    ///
    /// Relative paths inside the file resolve against its directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: LoadConfig = serde_yaml::from_str(&contents)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.schema);
        if let Some(p) = self.logfile.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.reject_file.as_mut() {
            resolve(p);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feedback_size == 0 {
            return Err(ConfigError::Invalid("feedback_size must be positive".to_string()));
        }
        if let (Some(begin), Some(end)) = (self.slice_begin, self.slice_end) {
            if begin > end {
                return Err(ConfigError::Invalid(format!(
                    "slice_begin {} is after slice_end {}",
                    begin, end
                )));
            }
        }
        Ok(())
    }

    /// Apply `DATABASE_URL` and `ETL_FEEDBACK` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = Some(url);
        }
        if let Some(value) = lookup(ENV_FEEDBACK) {
            self.feedback_size = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidEnv {
                    name: ENV_FEEDBACK.to_string(),
                    value: value.clone(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SourceFormat;

    const CONFIG: &str = r#"
schema: schema.yaml
entity: Person
strict: true
slice_begin: 2
slice_end: 10
reject_file: out/rejects.ndjson
reader:
  format: geojson
transform:
  mappings:
    name: NAME
engine:
  persistence: [name]
  create_foreign_key: false
  max_depth: 4
database:
  max_connections: 2
"#;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etl.yaml");
        fs::write(&path, CONFIG).unwrap();

        let config = LoadConfig::load_from_file(&path).unwrap();

        assert_eq!(config.schema, dir.path().join("schema.yaml"));
        assert_eq!(config.reject_file, Some(dir.path().join("out/rejects.ndjson")));
        assert_eq!(config.entity, "Person");
        assert!(config.strict);
        assert_eq!(config.feedback_size, DEFAULT_FEEDBACK_SIZE);
        assert_eq!(config.reader.format, SourceFormat::GeoJson);
        assert_eq!(config.reader.delimiter, '\t');
        assert_eq!(config.transform.mappings["name"], "NAME");
        assert_eq!(config.engine.persistence, Some(vec!["name".to_string()]));
        assert!(!config.engine.create_foreign_key);
        assert!(config.engine.create);
        assert_eq!(config.engine.max_depth, 4);
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.database.min_idle, 1);
    }

    #[test]
    fn test_invalid_slice() {
        let mut config = LoadConfig::new("schema.yaml", "Person");
        config.slice_begin = Some(5);
        config.slice_end = Some(2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = LoadConfig::new("schema.yaml", "Person");
        config
            .apply_overrides(|name| match name {
                ENV_DATABASE_URL => Some("postgres://localhost/etl".to_string()),
                ENV_FEEDBACK => Some("250".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/etl"));
        assert_eq!(config.feedback_size, 250);

        let err = config
            .apply_overrides(|name| (name == ENV_FEEDBACK).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
