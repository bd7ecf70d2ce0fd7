//! SQL generation for [`super::PgStore`].
//!
//! Every value is bound as nullable text and cast on the server according to
//! the field kind, so one bind type covers the whole schema.

use convert_case::{Case, Casing};

use crate::entity::{Record, Value};
use crate::schema::{EntityTypeDescriptor, FieldDescriptor, FieldKind, SURROGATE_KEY};
use crate::storage::{Query, StorageError};

/// SQL text plus its positional parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Register a parameter and return its placeholder, cast for `kind`.
    fn param(&mut self, kind: Option<&FieldKind>, value: Option<String>) -> String {
        self.params.push(value);
        placeholder(kind, self.params.len())
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column of a field. Single references live in `<field>_id`.
pub fn column_name(field: &FieldDescriptor) -> String {
    match field.kind {
        FieldKind::Reference { .. } => format!("{}_id", field.name),
        _ => field.name.clone(),
    }
}

/// Placeholder `$n` with the cast the field kind needs. `None` is the surrogate key.
pub fn placeholder(kind: Option<&FieldKind>, n: usize) -> String {
    match kind {
        Some(FieldKind::Text) => format!("${}", n),
        Some(FieldKind::Integer) | Some(FieldKind::Reference { .. }) | None => format!("${}::bigint", n),
        Some(FieldKind::Float) => format!("${}::double precision", n),
        Some(FieldKind::Boolean) => format!("${}::boolean", n),
        Some(FieldKind::DateTime { .. }) => format!("${}::timestamp", n),
        Some(FieldKind::Geometry { .. }) => format!("ST_GeomFromEWKT(${})", n),
        Some(FieldKind::Collection { .. }) => format!("${}", n),
    }
}

/// Text form of a prepared value, as bound to the statement.
pub fn bind_text(value: &Value) -> Result<Option<String>, StorageError> {
    // References render as their id, geometries as EWKT.
    match value {
        Value::List(_) | Value::Dict(_) => Err(StorageError::Unsupported(format!(
            "cannot store a {} in a column",
            value.type_name()
        ))),
        other => Ok(other.to_text()),
    }
}

/// Column and cast kind of a queryable field name.
fn lookup<'d>(
    descriptor: &'d EntityTypeDescriptor,
    name: &str,
) -> Result<(String, Option<&'d FieldKind>), StorageError> {
    if name == SURROGATE_KEY {
        return Ok((SURROGATE_KEY.to_string(), None));
    }
    match descriptor.get_field(name) {
        Some(field) if !field.is_collection() => Ok((column_name(field), Some(&field.kind))),
        _ => Err(StorageError::Unsupported(format!(
            "{} has no column for '{}'",
            descriptor.name, name
        ))),
    }
}

fn table(descriptor: &EntityTypeDescriptor) -> String {
    quote_ident(&descriptor.table_name())
}

pub fn select_by_id(descriptor: &EntityTypeDescriptor, id: i64) -> Statement {
    let mut stmt = Statement::new();
    let key = stmt.param(None, Some(id.to_string()));
    stmt.sql = format!(
        "SELECT {id} FROM {} WHERE {id} = {}",
        table(descriptor),
        key,
        id = quote_ident(SURROGATE_KEY)
    );
    stmt
}

pub fn select_matching(descriptor: &EntityTypeDescriptor, query: &Query) -> Result<Statement, StorageError> {
    let mut stmt = Statement::new();
    let mut conditions = Vec::with_capacity(query.conditions.len());
    for (name, value) in &query.conditions {
        let (column, kind) = lookup(descriptor, name)?;
        let condition = match bind_text(value)? {
            None => format!("{} IS NULL", quote_ident(&column)),
            text => format!("{} = {}", quote_ident(&column), stmt.param(kind, text)),
        };
        conditions.push(condition);
    }

    stmt.sql = format!("SELECT {} FROM {}", quote_ident(SURROGATE_KEY), table(descriptor));
    if !conditions.is_empty() {
        stmt.sql.push_str(" WHERE ");
        stmt.sql.push_str(&conditions.join(" AND "));
    }
    stmt.sql.push_str(&format!(" ORDER BY {}", quote_ident(SURROGATE_KEY)));
    Ok(stmt)
}

/// Writable (column, field) pairs of `values`, in descriptor order.
fn writable<'d>(descriptor: &'d EntityTypeDescriptor, values: &Record) -> Vec<&'d FieldDescriptor> {
    descriptor
        .fields
        .iter()
        .filter(|f| !f.is_collection() && !f.is_auto_managed() && values.contains_key(&f.name))
        .collect()
}

pub fn insert(descriptor: &EntityTypeDescriptor, values: &Record) -> Result<Statement, StorageError> {
    let mut stmt = Statement::new();
    let mut columns = Vec::new();
    let mut exprs = Vec::new();

    for field in writable(descriptor, values) {
        let text = bind_text(&values[&field.name])?;
        columns.push(quote_ident(&column_name(field)));
        exprs.push(stmt.param(Some(&field.kind), text));
    }
    for field in descriptor.fields.iter().filter(|f| f.is_auto_managed()) {
        columns.push(quote_ident(&column_name(field)));
        exprs.push("now()".to_string());
    }

    stmt.sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table(descriptor))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table(descriptor),
            columns.join(", "),
            exprs.join(", ")
        )
    };
    stmt.sql.push_str(&format!(" RETURNING {}", quote_ident(SURROGATE_KEY)));
    Ok(stmt)
}

/// Partial update touching the row only when a value differs.
///
/// Returns `None` when `values` holds nothing writable.
pub fn update(descriptor: &EntityTypeDescriptor, id: i64, values: &Record) -> Result<Option<Statement>, StorageError> {
    let fields = writable(descriptor, values);
    if fields.is_empty() {
        return Ok(None);
    }

    let mut stmt = Statement::new();
    let key = stmt.param(None, Some(id.to_string()));
    let mut assignments = Vec::new();
    let mut changes = Vec::new();

    for field in fields {
        let column = quote_ident(&column_name(field));
        let expr = stmt.param(Some(&field.kind), bind_text(&values[&field.name])?);
        changes.push(format!("{} IS DISTINCT FROM {}", column, expr));
        assignments.push(format!("{} = {}", column, expr));
    }
    for field in descriptor.fields.iter() {
        if let FieldKind::DateTime { auto_now: true, .. } = field.kind {
            assignments.push(format!("{} = now()", quote_ident(&column_name(field))));
        }
    }

    stmt.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} AND ({})",
        table(descriptor),
        assignments.join(", "),
        quote_ident(SURROGATE_KEY),
        key,
        changes.join(" OR ")
    );
    Ok(Some(stmt))
}

/// Join table and its (owner, target) columns for a native collection.
///
/// Defaults: table `<owner_table>_<field>`, columns `<owner_table>_id` and
/// `<target_table>_id`.
pub fn join_table(descriptor: &EntityTypeDescriptor, field: &FieldDescriptor) -> Result<(String, String, String), StorageError> {
    let FieldKind::Collection {
        to,
        through,
        join_table,
        owner_column,
        target_column,
    } = &field.kind
    else {
        return Err(StorageError::Unsupported(format!("{} is not a collection", field.name)));
    };
    if through.is_some() {
        return Err(StorageError::Unsupported(format!(
            "{}.{} links through an entity type",
            descriptor.name, field.name
        )));
    }

    let owner_table = descriptor.table_name();
    Ok((
        join_table
            .clone()
            .unwrap_or_else(|| format!("{}_{}", owner_table, field.name)),
        owner_column
            .clone()
            .unwrap_or_else(|| format!("{}_id", owner_table)),
        target_column
            .clone()
            .unwrap_or_else(|| format!("{}_id", to.to_case(Case::Snake))),
    ))
}

pub fn link(
    descriptor: &EntityTypeDescriptor,
    field: &FieldDescriptor,
    owner: i64,
    member: i64,
) -> Result<Statement, StorageError> {
    let (table, owner_column, target_column) = join_table(descriptor, field)?;
    let mut stmt = Statement::new();
    let owner = stmt.param(None, Some(owner.to_string()));
    let member = stmt.param(None, Some(member.to_string()));
    stmt.sql = format!(
        "INSERT INTO {} ({}, {}) VALUES ({}, {}) ON CONFLICT DO NOTHING",
        quote_ident(&table),
        quote_ident(&owner_column),
        quote_ident(&target_column),
        owner,
        member
    );
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::geometry::Geometry;
    use crate::record;

    fn person() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new("Person")
            .field(FieldDescriptor::text("name").unique())
            .field(FieldDescriptor::integer("age").nullable())
            .field(FieldDescriptor::reference("employer", "Company").nullable())
            .field(FieldDescriptor::geometry("home", 2).nullable())
            .field(FieldDescriptor::datetime("last_modified").auto_now())
            .field(FieldDescriptor::collection("tags", "ProjectTag"))
    }

    #[test]
    fn test_select_matching() {
        let query = Query::new()
            .eq("name", Value::from("Ann"))
            .eq("employer", Value::Entity(EntityRef::new("Company", 4)))
            .eq("age", Value::Null);
        let stmt = select_matching(&person(), &query).unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT "id" FROM "person" WHERE "name" = $1 AND "employer_id" = $2::bigint AND "age" IS NULL ORDER BY "id""#
        );
        assert_eq!(stmt.params, vec![Some("Ann".to_string()), Some("4".to_string())]);
    }

    #[test]
    fn test_unknown_query_field() {
        let query = Query::new().eq("tags", Value::from("x"));
        assert!(matches!(
            select_matching(&person(), &query),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_insert() {
        let home = Geometry::from_wkt("SRID=4326;POINT (16.9 52.4)").unwrap();
        let values = record! { "age" => 30, "name" => "Ann", "home" => home, "tags" => Vec::<Value>::new() };
        let stmt = insert(&person(), &values).unwrap();

        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "person" ("name", "age", "home", "last_modified") VALUES ($1, $2::bigint, ST_GeomFromEWKT($3), now()) RETURNING "id""#
        );
        assert_eq!(
            stmt.params,
            vec![
                Some("Ann".to_string()),
                Some("30".to_string()),
                Some("SRID=4326;POINT (16.9 52.4)".to_string()),
            ]
        );
    }

    #[test]
    fn test_insert_without_values() {
        let stmt = insert(&EntityTypeDescriptor::new("Marker"), &Record::new()).unwrap();
        assert_eq!(stmt.sql, r#"INSERT INTO "marker" DEFAULT VALUES RETURNING "id""#);
    }

    #[test]
    fn test_update_only_when_distinct() {
        let stmt = update(&person(), 7, &record! { "age" => 31, "employer" => Value::Null })
            .unwrap()
            .unwrap();

        assert_eq!(
            stmt.sql,
            r#"UPDATE "person" SET "age" = $2::bigint, "employer_id" = $3::bigint, "last_modified" = now() WHERE "id" = $1::bigint AND ("age" IS DISTINCT FROM $2::bigint OR "employer_id" IS DISTINCT FROM $3::bigint)"#
        );
        assert_eq!(stmt.params, vec![Some("7".to_string()), Some("31".to_string()), None]);
        assert!(update(&person(), 7, &record! { "last_modified" => "now" }).unwrap().is_none());
    }

    #[test]
    fn test_native_link() {
        let descriptor = person();
        let stmt = link(&descriptor, descriptor.get_field("tags").unwrap(), 1, 2).unwrap();
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "person_tags" ("person_id", "project_tag_id") VALUES ($1::bigint, $2::bigint) ON CONFLICT DO NOTHING"#
        );
    }

    #[test]
    fn test_through_link_is_not_native() {
        let field = FieldDescriptor::collection("projects", "Project").through("Membership", "person", "project");
        assert!(matches!(
            join_table(&person(), &field),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_bind_text() {
        assert_eq!(bind_text(&Value::Bool(false)).unwrap(), Some("false".to_string()));
        assert_eq!(bind_text(&Value::Float(1.5)).unwrap(), Some("1.5".to_string()));
        assert!(bind_text(&Value::List(vec![])).is_err());
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
