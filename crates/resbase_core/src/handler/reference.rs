//! Single entity reference handlers and the resolvers behind them.
//!
//! # Responsibility
//! - Resolve references by id (`#12`) or by name through an `EntityResolver`.
//! - Check reference domains (class membership or allowed principal names).
//!
//! # Invariants
//! - Converted references always point at an existing entity.
//! - Stored references are not re-validated on retrieve.

use super::domain::name_list;
use super::preload::PreloadCache;
use super::{
    expect_row, require_stored, wrong_type, AttributeError, AttributeHandler, AttributeResult,
};
use crate::model::flags::Conditions;
use crate::model::ids::{ClassId, PermissionId, ResourceId, RoleId, SubjectId, ValueId};
use crate::model::value::{AttributeValue, RawValue};
use parking_lot::RwLock;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const RESOURCE_LINEAGE_SQL: &str = "WITH RECURSIVE lineage(id) AS (
    SELECT class_id FROM resources WHERE id = ?1
    UNION
    SELECT class_parents.parent_id
    FROM class_parents
    JOIN lineage ON class_parents.class_id = lineage.id
)
SELECT EXISTS(
    SELECT 1
    FROM lineage
    JOIN resource_classes ON resource_classes.id = lineage.id
    WHERE resource_classes.name = ?2
);";

const CLASS_LINEAGE_SQL: &str = "WITH RECURSIVE lineage(id) AS (
    SELECT ?1
    UNION
    SELECT class_parents.parent_id
    FROM class_parents
    JOIN lineage ON class_parents.class_id = lineage.id
)
SELECT EXISTS(
    SELECT 1
    FROM lineage
    JOIN resource_classes ON resource_classes.id = lineage.id
    WHERE resource_classes.name = ?2
);";

/// Resolves entity ids and names for reference attributes.
pub trait EntityResolver: Send + Sync {
    /// Entity name used in `EntityNotFound` errors.
    fn entity(&self) -> &'static str;

    fn exists(&self, conn: &Connection, id: i64) -> AttributeResult<bool>;

    fn find_by_name(&self, conn: &Connection, name: &str) -> AttributeResult<Option<i64>>;

    fn check_domain(&self, conn: &Connection, domain: &str, id: Option<i64>) -> AttributeResult<()>;

    /// Resolves an id, failing with `EntityNotFound` when it is unknown.
    fn instantiate(&self, conn: &Connection, id: i64) -> AttributeResult<i64> {
        if self.exists(conn, id)? {
            Ok(id)
        } else {
            Err(AttributeError::EntityNotFound {
                entity: self.entity(),
                id,
            })
        }
    }

    /// Resolves `#<id>` or a name.
    fn instantiate_name(&self, conn: &Connection, text: &str) -> AttributeResult<i64> {
        let trimmed = text.trim();
        if let Some(id) = trimmed.strip_prefix('#') {
            let id = id.parse::<i64>().map_err(|err| {
                AttributeError::invalid(format!("`{trimmed}` is not a {} id: {err}", self.entity()))
            })?;
            return self.instantiate(conn, id);
        }
        self.find_by_name(conn, trimmed)?.ok_or_else(|| {
            AttributeError::invalid(format!("no {} named `{trimmed}`", self.entity()))
        })
    }
}

fn class_exists(conn: &Connection, name: &str) -> AttributeResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM resource_classes WHERE name = ?1);",
        [name],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn require_class_domain<'a>(conn: &Connection, domain: &'a str) -> AttributeResult<&'a str> {
    let class_name = domain.trim();
    if !class_exists(conn, class_name)? {
        return Err(AttributeError::invalid(format!(
            "domain names unknown resource class `{class_name}`"
        )));
    }
    Ok(class_name)
}

/// Resolver over the `resources` metadata table.
#[derive(Debug, Default)]
pub struct ResourceResolver;

impl ResourceResolver {
    /// True when the resource's class is `class_name` or descends from it.
    pub fn is_instance_of(conn: &Connection, id: i64, class_name: &str) -> AttributeResult<bool> {
        let matches: i64 =
            conn.query_row(RESOURCE_LINEAGE_SQL, params![id, class_name], |row| row.get(0))?;
        Ok(matches == 1)
    }
}

impl EntityResolver for ResourceResolver {
    fn entity(&self) -> &'static str {
        "resources"
    }

    fn exists(&self, conn: &Connection, id: i64) -> AttributeResult<bool> {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM resources WHERE id = ?1);",
            [id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn find_by_name(&self, conn: &Connection, name: &str) -> AttributeResult<Option<i64>> {
        let mut stmt = conn.prepare("SELECT id FROM resources WHERE name = ?1 ORDER BY id LIMIT 2;")?;
        let ids = stmt
            .query_map([name], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        match ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => Err(AttributeError::invalid(format!(
                "resource name `{name}` is ambiguous"
            ))),
        }
    }

    /// Domain is a resource class name the referenced resource must belong to.
    fn check_domain(&self, conn: &Connection, domain: &str, id: Option<i64>) -> AttributeResult<()> {
        let class_name = require_class_domain(conn, domain)?;
        match id {
            Some(id) if !Self::is_instance_of(conn, id, class_name)? => {
                Err(AttributeError::violation(format!(
                    "resource #{id} is not an instance of `{class_name}`"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Resolver over the `resource_classes` catalog table.
#[derive(Debug, Default)]
pub struct ClassResolver;

impl EntityResolver for ClassResolver {
    fn entity(&self) -> &'static str {
        "resource_classes"
    }

    fn exists(&self, conn: &Connection, id: i64) -> AttributeResult<bool> {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM resource_classes WHERE id = ?1);",
            [id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn find_by_name(&self, conn: &Connection, name: &str) -> AttributeResult<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT id FROM resource_classes WHERE name = ?1;",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Domain is a class name; the referenced class must be it or a subclass.
    fn check_domain(&self, conn: &Connection, domain: &str, id: Option<i64>) -> AttributeResult<()> {
        let class_name = require_class_domain(conn, domain)?;
        let Some(id) = id else {
            return Ok(());
        };
        let matches: i64 =
            conn.query_row(CLASS_LINEAGE_SQL, params![id, class_name], |row| row.get(0))?;
        if matches == 1 {
            Ok(())
        } else {
            Err(AttributeError::violation(format!(
                "class #{id} does not derive from `{class_name}`"
            )))
        }
    }
}

/// Principal families served by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrincipalKind {
    Role,
    Subject,
    Permission,
}

impl PrincipalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Role => "roles",
            Self::Subject => "subjects",
            Self::Permission => "permissions",
        }
    }
}

/// External security/identity provider.
pub trait IdentityDirectory: Send + Sync {
    fn name_of(&self, kind: PrincipalKind, id: i64) -> Option<String>;
    fn id_of(&self, kind: PrincipalKind, name: &str) -> Option<i64>;
}

/// In-memory identity directory for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryIdentityDirectory {
    entries: RwLock<HashMap<PrincipalKind, BTreeMap<i64, String>>>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: PrincipalKind, id: i64, name: impl Into<String>) {
        self.entries
            .write()
            .entry(kind)
            .or_default()
            .insert(id, name.into());
    }

    pub fn remove(&self, kind: PrincipalKind, id: i64) -> bool {
        self.entries
            .write()
            .get_mut(&kind)
            .is_some_and(|names| names.remove(&id).is_some())
    }
}

impl IdentityDirectory for MemoryIdentityDirectory {
    fn name_of(&self, kind: PrincipalKind, id: i64) -> Option<String> {
        self.entries
            .read()
            .get(&kind)
            .and_then(|names| names.get(&id).cloned())
    }

    fn id_of(&self, kind: PrincipalKind, name: &str) -> Option<i64> {
        self.entries.read().get(&kind).and_then(|names| {
            names
                .iter()
                .find(|(_, candidate)| candidate.as_str() == name)
                .map(|(id, _)| *id)
        })
    }
}

/// Resolver for roles, subjects and permissions.
pub struct PrincipalResolver {
    kind: PrincipalKind,
    directory: Arc<dyn IdentityDirectory>,
}

impl PrincipalResolver {
    pub fn new(kind: PrincipalKind, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { kind, directory }
    }
}

impl EntityResolver for PrincipalResolver {
    fn entity(&self) -> &'static str {
        self.kind.as_str()
    }

    fn exists(&self, _conn: &Connection, id: i64) -> AttributeResult<bool> {
        Ok(self.directory.name_of(self.kind, id).is_some())
    }

    fn find_by_name(&self, _conn: &Connection, name: &str) -> AttributeResult<Option<i64>> {
        Ok(self.directory.id_of(self.kind, name))
    }

    /// Domain is a comma list of allowed principal names.
    fn check_domain(&self, _conn: &Connection, domain: &str, id: Option<i64>) -> AttributeResult<()> {
        let allowed = name_list(domain)?;
        let Some(id) = id else {
            return Ok(());
        };
        let name = self
            .directory
            .name_of(self.kind, id)
            .ok_or(AttributeError::EntityNotFound {
                entity: self.kind.as_str(),
                id,
            })?;
        if allowed.iter().any(|candidate| *candidate == name) {
            Ok(())
        } else {
            Err(AttributeError::violation(format!(
                "`{name}` is not one of `{domain}`"
            )))
        }
    }
}

/// Kind of entity a single reference attribute points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Resource,
    Role,
    Subject,
    Permission,
    ResourceClass,
}

impl ReferenceKind {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Role => "role",
            Self::Subject => "subject",
            Self::Permission => "permission",
            Self::ResourceClass => "resource_class",
        }
    }

    fn value_table(self) -> &'static str {
        match self {
            Self::Resource => "av_resource",
            Self::Role => "av_role",
            Self::Subject => "av_subject",
            Self::Permission => "av_permission",
            Self::ResourceClass => "av_resource_class",
        }
    }

    fn foreign_table(self) -> Option<&'static str> {
        match self {
            Self::Resource => Some("resources"),
            Self::ResourceClass => Some("resource_classes"),
            Self::Role | Self::Subject | Self::Permission => None,
        }
    }

    fn wrap(self, id: i64) -> AttributeValue {
        match self {
            Self::Resource => AttributeValue::Resource(ResourceId(id)),
            Self::Role => AttributeValue::Role(RoleId(id)),
            Self::Subject => AttributeValue::Subject(SubjectId(id)),
            Self::Permission => AttributeValue::Permission(PermissionId(id)),
            Self::ResourceClass => AttributeValue::ResourceClass(ClassId(id)),
        }
    }

    fn unwrap(self, value: &AttributeValue) -> Option<i64> {
        match (self, value) {
            (Self::Resource, AttributeValue::Resource(id)) => Some(id.get()),
            (Self::Role, AttributeValue::Role(id)) => Some(id.get()),
            (Self::Subject, AttributeValue::Subject(id)) => Some(id.get()),
            (Self::Permission, AttributeValue::Permission(id)) => Some(id.get()),
            (Self::ResourceClass, AttributeValue::ResourceClass(id)) => Some(id.get()),
            _ => None,
        }
    }
}

/// Handler for a single entity reference, stored as the entity id.
pub struct ReferenceHandler {
    kind: ReferenceKind,
    resolver: Arc<dyn EntityResolver>,
    preload: PreloadCache,
}

impl ReferenceHandler {
    pub fn new(kind: ReferenceKind, resolver: Arc<dyn EntityResolver>) -> Self {
        Self {
            kind,
            resolver,
            preload: PreloadCache::default(),
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    fn id_of(&self, value: &AttributeValue) -> AttributeResult<i64> {
        self.kind
            .unwrap(value)
            .ok_or_else(|| wrong_type(self.kind.type_name(), value))
    }
}

impl AttributeHandler for ReferenceHandler {
    fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    fn value_table(&self) -> &'static str {
        self.kind.value_table()
    }

    fn column_type(&self) -> &'static str {
        "INTEGER"
    }

    fn foreign_table(&self) -> Option<&'static str> {
        self.kind.foreign_table()
    }

    fn is_foreign_key(&self) -> bool {
        true
    }

    fn supports_external_string(&self) -> bool {
        true
    }

    fn supported_conditions(&self) -> Conditions {
        Conditions::EQUALITY
    }

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId> {
        let target = self.id_of(value)?;
        conn.execute(
            &format!("INSERT INTO {} (value) VALUES (?1);", self.value_table()),
            [target],
        )?;
        let id = ValueId(conn.last_insert_rowid());
        self.preload.invalidate(id);
        Ok(id)
    }

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue> {
        require_stored(self.value_table(), id)?;
        if let Some(value) = self.preload.get(id) {
            return Ok(value);
        }
        let target: Option<i64> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE value_id = ?1;", self.value_table()),
                [id.get()],
                |row| row.get(0),
            )
            .optional()?;
        let value = target
            .map(|target| self.kind.wrap(target))
            .ok_or(AttributeError::EntityNotFound {
                entity: self.value_table(),
                id: id.get(),
            })?;
        if conn.is_autocommit() {
            self.preload.put(id, &value);
        }
        Ok(value)
    }

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()> {
        require_stored(self.value_table(), id)?;
        let target = self.id_of(value)?;
        let changed = conn.execute(
            &format!("UPDATE {} SET value = ?1 WHERE value_id = ?2;", self.value_table()),
            params![target, id.get()],
        )?;
        self.preload.invalidate(id);
        expect_row(changed, self.value_table(), id)
    }

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()> {
        require_stored(self.value_table(), id)?;
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE value_id = ?1;", self.value_table()),
            [id.get()],
        )?;
        self.preload.invalidate(id);
        expect_row(changed, self.value_table(), id)
    }

    fn to_attribute_value(
        &self,
        conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>> {
        let target = match raw {
            RawValue::Null => return Ok(None),
            RawValue::Value(value) => self.id_of(&value)?,
            RawValue::Integer(id) => id,
            RawValue::Text(text) => {
                return self
                    .resolver
                    .instantiate_name(conn, &text)
                    .map(|id| Some(self.kind.wrap(id)))
            }
            RawValue::Boolean(_) => {
                return Err(AttributeError::invalid(format!(
                    "a boolean is not a {} reference",
                    self.kind.type_name()
                )))
            }
        };
        self.resolver
            .instantiate(conn, target)
            .map(|id| Some(self.kind.wrap(id)))
    }

    fn to_external_string(&self, value: &AttributeValue) -> AttributeResult<String> {
        Ok(format!("#{}", self.id_of(value)?))
    }

    fn to_column(&self, value: &AttributeValue) -> AttributeResult<SqlValue> {
        Ok(SqlValue::Integer(self.id_of(value)?))
    }

    fn from_column(&self, value: SqlValue) -> AttributeResult<AttributeValue> {
        match value {
            SqlValue::Integer(id) => Ok(self.kind.wrap(id)),
            other => Err(AttributeError::invalid(format!(
                "stored {} reference has column type {:?}",
                self.kind.type_name(),
                other.data_type()
            ))),
        }
    }

    fn check_domain(
        &self,
        conn: &Connection,
        domain: &str,
        value: Option<&AttributeValue>,
    ) -> AttributeResult<()> {
        let target = value.map(|value| self.id_of(value)).transpose()?;
        self.resolver.check_domain(conn, domain, target)
    }

    fn contains_resource_references(&self) -> bool {
        self.kind == ReferenceKind::Resource
    }

    fn resource_references(&self, value: &AttributeValue) -> Vec<ResourceId> {
        match value {
            AttributeValue::Resource(id) if self.kind == ReferenceKind::Resource => vec![*id],
            _ => Vec::new(),
        }
    }

    fn activate(&self, conn: &Connection) -> AttributeResult<usize> {
        let mut stmt = conn.prepare(&format!(
            "SELECT value_id, value FROM {} ORDER BY value_id;",
            self.value_table()
        ))?;
        let loaded = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .map(|row| row.map(|(id, target)| (id, self.kind.wrap(target))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.preload.fill(loaded))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        EntityResolver, IdentityDirectory, MemoryIdentityDirectory, PrincipalKind,
        PrincipalResolver, ReferenceHandler, ReferenceKind,
    };
    use crate::handler::{AttributeError, AttributeHandler};
    use crate::model::ids::RoleId;
    use crate::model::value::{AttributeValue, RawValue};
    use rusqlite::Connection;
    use std::sync::Arc;

    fn directory() -> Arc<MemoryIdentityDirectory> {
        let directory = MemoryIdentityDirectory::new();
        directory.insert(PrincipalKind::Role, 1, "admin");
        directory.insert(PrincipalKind::Role, 2, "guest");
        Arc::new(directory)
    }

    #[test]
    fn memory_directory_resolves_both_ways() {
        let directory = directory();
        assert_eq!(directory.id_of(PrincipalKind::Role, "guest"), Some(2));
        assert_eq!(
            directory.name_of(PrincipalKind::Role, 1).as_deref(),
            Some("admin")
        );
        assert_eq!(directory.id_of(PrincipalKind::Subject, "guest"), None);
        assert!(directory.remove(PrincipalKind::Role, 2));
        assert_eq!(directory.id_of(PrincipalKind::Role, "guest"), None);
    }

    #[test]
    fn role_references_convert_by_name_and_id() {
        let conn = Connection::open_in_memory().unwrap();
        let resolver = Arc::new(PrincipalResolver::new(PrincipalKind::Role, directory()));
        let handler = ReferenceHandler::new(ReferenceKind::Role, resolver.clone());

        let by_name = handler
            .to_attribute_value(&conn, RawValue::from("admin"))
            .unwrap();
        assert_eq!(by_name, Some(AttributeValue::Role(RoleId(1))));
        let by_id = handler.to_attribute_value(&conn, RawValue::from("#2")).unwrap();
        assert_eq!(by_id, Some(AttributeValue::Role(RoleId(2))));
        assert!(matches!(
            handler.to_attribute_value(&conn, RawValue::Integer(9)),
            Err(AttributeError::EntityNotFound { id: 9, .. })
        ));
        assert_eq!(
            handler
                .to_external_string(&AttributeValue::Role(RoleId(2)))
                .unwrap(),
            "#2"
        );
        assert_eq!(resolver.instantiate_name(&conn, "guest").unwrap(), 2);
    }

    #[test]
    fn role_domain_is_a_name_list() {
        let conn = Connection::open_in_memory().unwrap();
        let resolver = Arc::new(PrincipalResolver::new(PrincipalKind::Role, directory()));
        let handler = ReferenceHandler::new(ReferenceKind::Role, resolver);
        let admin = AttributeValue::Role(RoleId(1));
        let guest = AttributeValue::Role(RoleId(2));
        assert!(handler.check_domain(&conn, "admin,editor", Some(&admin)).is_ok());
        assert!(matches!(
            handler.check_domain(&conn, "admin,editor", Some(&guest)),
            Err(AttributeError::ConstraintViolation(_))
        ));
        assert!(handler.check_domain(&conn, " ", None).is_err());
    }
}
