//! Error taxonomy of the reconciliation engine.
//!
//! Every variant names the entity type it concerns so that a batch driver can
//! produce a useful log line without further context. Rejections that are not
//! errors (ambiguous matches, creation disabled) are reported through
//! [`crate::reconcile::Outcome::Rejected`] instead.

use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = EtlError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EtlError {
    /// The schema offers no single identity field for resolving a bare value.
    #[error("cannot resolve a bare value into {entity_type}: {reason}")]
    AmbiguousIdentity { entity_type: String, reason: String },

    /// An explicit key reference points at nothing.
    #[error("{entity_type} with {field}={value} does not exist")]
    ReferenceNotFound {
        entity_type: String,
        field: String,
        value: String,
    },

    /// A field value cannot be prepared for storage.
    #[error("invalid value for {entity_type}.{field}: {message}")]
    Validation {
        entity_type: String,
        field: String,
        message: String,
    },

    /// The input as a whole has a shape the engine cannot reconcile.
    #[error("invalid input for {entity_type}: {message}")]
    InvalidInput { entity_type: String, message: String },

    /// Storage refused a write (unique, foreign-key or not-null violation),
    /// or a nested reference could not be resolved.
    #[error("{entity_type} rejected by storage: {message}")]
    StorageConstraint { entity_type: String, message: String },

    /// Reference nesting went deeper than the configured limit.
    #[error("reference nesting deeper than {max_depth} levels while resolving {entity_type}")]
    CyclicReference { entity_type: String, max_depth: usize },

    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    /// Backend failure (connection, protocol). Never record-specific.
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),
}

impl EtlError {
    /// Map a storage error raised while writing `entity_type`.
    pub fn from_storage(entity_type: &str, err: StorageError) -> Self {
        match err {
            StorageError::Constraint(message) => EtlError::StorageConstraint {
                entity_type: entity_type.to_string(),
                message,
            },
            other => EtlError::Storage(other),
        }
    }

    pub fn validation(entity_type: &str, field: &str, message: impl Into<String>) -> Self {
        EtlError::Validation {
            entity_type: entity_type.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Problems confined to the record at hand: a batch can skip the record and go on.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            EtlError::Validation { .. }
                | EtlError::InvalidInput { .. }
                | EtlError::StorageConstraint { .. }
        )
    }

    /// Schema or data-shape problems. The engine raises these rather than
    /// guessing; a driver decides whether they end the batch.
    pub fn is_data_shape(&self) -> bool {
        matches!(
            self,
            EtlError::AmbiguousIdentity { .. }
                | EtlError::ReferenceNotFound { .. }
                | EtlError::CyclicReference { .. }
        )
    }

    /// Entity type the error concerns, if any.
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            EtlError::AmbiguousIdentity { entity_type, .. }
            | EtlError::ReferenceNotFound { entity_type, .. }
            | EtlError::Validation { entity_type, .. }
            | EtlError::InvalidInput { entity_type, .. }
            | EtlError::StorageConstraint { entity_type, .. }
            | EtlError::CyclicReference { entity_type, .. } => Some(entity_type),
            EtlError::UnknownEntityType(name) => Some(name),
            EtlError::Storage(_) => None,
        }
    }
}
