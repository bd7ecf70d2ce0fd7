//! # etl-sync: record reconciliation for relational loads
//!
//! etl-sync loads semi-structured records (dictionaries of loosely typed
//! values) into a relational store. For every record it decides whether the
//! record denotes something already stored, resolves nested references and
//! to-many relations to stored entities (creating them when allowed), and
//! writes the minimal create or update needed, so that re-running the same
//! load is a no-op.
//!
//! ## Pipeline
//!
//! ```text
//! reader -> transform -> Reconciler::get_instance -> Storage
//!                         |- prepare   (typed field values)
//!                         |- identity  (persistence criterion, content hash)
//!                         `- relations (deferred to-many links)
//! ```
//!
//! ## Example
//!
//! ```
//! use etl_sync::{record, EntityTypeDescriptor, FieldDescriptor, MemoryStore, Outcome,
//!                ReconcileOptions, Reconciler, Schema};
//!
//! let schema = Schema::new(vec![EntityTypeDescriptor::new("Person")
//!     .field(FieldDescriptor::text("name").unique())])
//! .unwrap();
//! let mut store = MemoryStore::new();
//! let mut reconciler = Reconciler::new(&schema, &mut store);
//!
//! let first = reconciler
//!     .reconcile_record("Person", record! { "name" => "Ann" }, &ReconcileOptions::default())
//!     .unwrap();
//! let again = reconciler
//!     .reconcile_record("Person", record! { "name" => "Ann" }, &ReconcileOptions::default())
//!     .unwrap();
//! assert_eq!(first.outcome, Outcome::Created);
//! assert_eq!(again.outcome, Outcome::Exists);
//! ```

// Core model
pub mod entity;
pub mod error;
pub mod geometry;
pub mod schema;

// Reconciliation engine
pub mod identity;
pub mod prepare;
pub mod reconcile;
pub mod relations;

// Storage backends
pub mod storage;
#[cfg(feature = "postgres")]
pub mod diesel_runtime;

// Batch loading
pub mod config;
pub mod loader;
pub mod reader;
pub mod serialization;
pub mod transform;

// Re-export key types
pub use entity::{EntityRef, Record, Value};
pub use error::{EtlError, Result};
pub use geometry::Geometry;
pub use schema::{EntityTypeDescriptor, FieldDescriptor, FieldKind, Schema, SchemaError, Through};

pub use identity::{CriterionSource, PersistenceCriterion};
pub use reconcile::{Outcome, ReconcileOptions, Reconciled, Reconciler, RejectReason, Rejection};

pub use storage::{MemoryStore, Query, Storage, StorageError};

pub use config::{ConfigError, LoadConfig};
pub use loader::{FeedbackCounter, LoadSummary, Loader, LoaderError};
pub use reader::{ReaderConfig, ReaderError, SourceFormat, SourceItem};
pub use transform::{TransformConfig, TransformError, TransformRegistry, Transformer};
