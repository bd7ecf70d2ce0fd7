//! Storage collaborator contract.
//!
//! The engine never talks to a database directly. Everything it needs from
//! persistent storage goes through [`Storage`]: attribute-equality lookups,
//! creation, partial updates and to-many linking. Implementations decide
//! transaction scope; the batch driver opens one transaction per record via
//! [`Storage::begin`].

pub mod memory;

use thiserror::Error;

use crate::entity::{EntityRef, Record, Value};
use crate::schema::{EntityTypeDescriptor, FieldDescriptor};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Constraint violation or invalid value in a single record's write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Conjunction of attribute-equality conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub conditions: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push((field.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Field names taking part in the query, for diagnostics.
    pub fn fields(&self) -> Vec<&str> {
        self.conditions.iter().map(|(f, _)| f.as_str()).collect()
    }
}

/// Generic query/insert/update capability over an external store.
pub trait Storage {
    /// Look up an entity by surrogate key.
    fn get(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        id: i64,
    ) -> Result<Option<EntityRef>, StorageError>;

    /// All entities matching every condition of `query`.
    fn find(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        query: &Query,
    ) -> Result<Vec<EntityRef>, StorageError>;

    /// Insert a new entity from prepared values.
    fn create(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        values: &Record,
    ) -> Result<EntityRef, StorageError>;

    /// Apply `values` to an existing entity, leaving other fields untouched.
    /// Returns whether any stored value changed.
    fn update(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        target: &EntityRef,
        values: &Record,
    ) -> Result<bool, StorageError>;

    /// Native to-many link. Linking an already linked pair is a no-op.
    fn add_related(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        field: &FieldDescriptor,
        owner: &EntityRef,
        related: &[EntityRef],
    ) -> Result<(), StorageError>;

    fn begin(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
