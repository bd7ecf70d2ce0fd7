//! PostgreSQL implementation of [`Storage`].

use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Nullable, Text};

use crate::entity::{EntityRef, Record};
use crate::schema::{EntityTypeDescriptor, FieldDescriptor};
use crate::storage::{Query, Storage, StorageError};

use super::database::PooledConnection;
use super::sql::{self, Statement};

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

/// Storage session on one pooled PostgreSQL connection.
pub struct PgStore {
    conn: PooledConnection,
}

impl PgStore {
    pub fn new(conn: PooledConnection) -> Self {
        Self { conn }
    }

    fn bound(stmt: Statement) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
        tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing");
        stmt.params
            .into_iter()
            .fold(diesel::sql_query(stmt.sql).into_boxed(), |query, param| {
                query.bind::<Nullable<Text>, _>(param)
            })
    }

    fn ids(&mut self, stmt: Statement) -> Result<Vec<i64>, StorageError> {
        let rows: Vec<IdRow> = Self::bound(stmt).load(&mut *self.conn).map_err(map_error)?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    fn execute(&mut self, stmt: Statement) -> Result<usize, StorageError> {
        Self::bound(stmt).execute(&mut *self.conn).map_err(map_error)
    }
}

/// PostgreSQL data exception (SQLSTATE class 22) messages caused by a
/// single record's values. diesel reports these as `Unknown`.
const DATA_EXCEPTIONS: &[&str] = &[
    "value too long for type",
    "invalid input syntax for",
    "out of range",
];

/// Constraint violations and per-value data exceptions become
/// [`StorageError::Constraint`]; anything else is a backend failure.
fn map_error(err: DieselError) -> StorageError {
    match err {
        DieselError::DatabaseError(kind, info) => classify(&kind, info.message()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn classify(kind: &DatabaseErrorKind, message: &str) -> StorageError {
    match kind {
        DatabaseErrorKind::UniqueViolation
        | DatabaseErrorKind::ForeignKeyViolation
        | DatabaseErrorKind::NotNullViolation
        | DatabaseErrorKind::CheckViolation => StorageError::Constraint(message.to_string()),
        DatabaseErrorKind::Unknown if DATA_EXCEPTIONS.iter().any(|m| message.contains(m)) => {
            StorageError::Constraint(message.to_string())
        }
        _ => StorageError::Backend(message.to_string()),
    }
}

impl Storage for PgStore {
    fn get(&mut self, descriptor: &EntityTypeDescriptor, id: i64) -> Result<Option<EntityRef>, StorageError> {
        let ids = self.ids(sql::select_by_id(descriptor, id))?;
        Ok(ids.first().map(|id| EntityRef::new(&descriptor.name, *id)))
    }

    fn find(&mut self, descriptor: &EntityTypeDescriptor, query: &Query) -> Result<Vec<EntityRef>, StorageError> {
        let ids = self.ids(sql::select_matching(descriptor, query)?)?;
        Ok(ids
            .into_iter()
            .map(|id| EntityRef::new(&descriptor.name, id))
            .collect())
    }

    fn create(&mut self, descriptor: &EntityTypeDescriptor, values: &Record) -> Result<EntityRef, StorageError> {
        let ids = self.ids(sql::insert(descriptor, values)?)?;
        let id = ids
            .first()
            .copied()
            .ok_or_else(|| StorageError::Backend(format!("INSERT into {} returned no id", descriptor.name)))?;
        Ok(EntityRef::new(&descriptor.name, id))
    }

    fn update(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        target: &EntityRef,
        values: &Record,
    ) -> Result<bool, StorageError> {
        match sql::update(descriptor, target.id, values)? {
            Some(stmt) => Ok(self.execute(stmt)? > 0),
            None => Ok(false),
        }
    }

    fn add_related(
        &mut self,
        descriptor: &EntityTypeDescriptor,
        field: &FieldDescriptor,
        owner: &EntityRef,
        related: &[EntityRef],
    ) -> Result<(), StorageError> {
        for member in related {
            self.execute(sql::link(descriptor, field, owner.id, member.id)?)?;
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        AnsiTransactionManager::begin_transaction(&mut *self.conn).map_err(map_error)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        AnsiTransactionManager::commit_transaction(&mut *self.conn).map_err(map_error)
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        AnsiTransactionManager::rollback_transaction(&mut *self.conn).map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violations_reject_the_record() {
        let err = classify(&DatabaseErrorKind::UniqueViolation, "duplicate key value violates unique constraint");
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[test]
    fn test_data_exceptions_reject_the_record() {
        for message in [
            "value too long for type character varying(32)",
            "invalid input syntax for type bigint: \"Ann\"",
            "value \"99999999999999999999\" is out of range for type bigint",
            "timestamp out of range",
        ] {
            let err = classify(&DatabaseErrorKind::Unknown, message);
            assert!(matches!(err, StorageError::Constraint(ref m) if m == message), "{message}");
        }
    }

    #[test]
    fn test_connection_failures_abort() {
        let err = classify(&DatabaseErrorKind::UnableToSendCommand, "could not send data to server");
        assert!(matches!(err, StorageError::Backend(_)));
        let err = classify(&DatabaseErrorKind::Unknown, "relation \"person\" does not exist");
        assert!(matches!(err, StorageError::Backend(_)));
    }
}
