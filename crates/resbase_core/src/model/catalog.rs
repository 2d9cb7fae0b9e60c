//! Persistent schema catalog and the live snapshot built from it.
//!
//! # Responsibility
//! - Keep `attribute_types` in sync with the handler registry.
//! - Bootstrap the root `resource` class and its builtin attributes.
//! - Load catalog rows into an immutable `SchemaSnapshot` and swap it in on
//!   every schema change.
//!
//! # Invariants
//! - One `Schema` owns one handler instance per attribute type.
//! - Attribute indices come from the `schema_counters` row and are never
//!   reused.
//! - Readers always see a complete snapshot; swaps happen under the write
//!   lock only.

use crate::handler::AttributeHandlerRegistry;
use crate::model::flags::AttributeFlags;
use crate::model::ids::{AttributeId, ClassId};
use crate::model::schema::{
    AttributeClass, AttributeDefinition, AttributeRecord, ClassRecord, ResourceClass,
    SchemaError, SchemaResult, SchemaSnapshot, StorageKind,
};
use log::info;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Name of the root class every resource class derives from.
pub const ROOT_CLASS: &str = "resource";

/// Builtin attributes declared on the root class; values live in the
/// `resources` metadata row.
pub const BUILTIN_ATTRIBUTES: &[(&str, &str, AttributeFlags)] = &[
    (
        "name",
        "string",
        AttributeFlags::BUILTIN.union(AttributeFlags::REQUIRED),
    ),
    ("owner", "subject", AttributeFlags::BUILTIN),
    ("parent", "resource", AttributeFlags::BUILTIN),
    (
        "created",
        "date",
        AttributeFlags::BUILTIN.union(AttributeFlags::READONLY),
    ),
    (
        "modified",
        "date",
        AttributeFlags::BUILTIN.union(AttributeFlags::READONLY),
    ),
];

/// Attributes of one class bound by name, in the caller's order.
#[derive(Debug, Clone)]
pub struct AttributeTable {
    class: Arc<ResourceClass>,
    attributes: Vec<Arc<AttributeDefinition>>,
}

impl AttributeTable {
    pub fn class(&self) -> &Arc<ResourceClass> {
        &self.class
    }

    /// Attribute bound at `position`.
    pub fn get(&self, position: usize) -> Option<&Arc<AttributeDefinition>> {
        self.attributes.get(position)
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<AttributeDefinition>> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AttributeDefinition>> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Schema catalog bound to one set of attribute handlers.
pub struct Schema {
    types: BTreeMap<String, Arc<AttributeClass>>,
    snapshot: RwLock<Arc<SchemaSnapshot>>,
}

impl Schema {
    /// Loads the catalog, registering attribute types and the root class
    /// first when they are missing.
    ///
    /// # Side effects
    /// - Writes `attribute_types` rows and, on a fresh database, the root
    ///   class with its builtin attributes.
    /// - Emits a `schema_load` logging event.
    pub fn load(conn: &Connection, registry: &AttributeHandlerRegistry) -> SchemaResult<Self> {
        let started_at = Instant::now();
        let mut types = BTreeMap::new();
        for type_name in registry.type_names() {
            let handler = registry
                .instantiate(type_name)
                .ok_or_else(|| SchemaError::UnknownAttributeType(type_name.to_string()))?;
            conn.execute(
                "INSERT INTO attribute_types (name, is_foreign_key, column_type, custom_storage)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    is_foreign_key = excluded.is_foreign_key,
                    column_type = excluded.column_type,
                    custom_storage = excluded.custom_storage;",
                params![
                    type_name,
                    handler.is_foreign_key(),
                    handler.column_type(),
                    !handler.supports_external_string()
                ],
            )?;
            types.insert(
                type_name.to_string(),
                Arc::new(AttributeClass::new(type_name, handler)),
            );
        }

        ensure_root_class(conn)?;
        let snapshot = read_snapshot(conn, &types)?;
        info!(
            "event=schema_load module=schema status=ok classes={} types={} duration_ms={}",
            snapshot.len(),
            types.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            types,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Rebuilds the snapshot from catalog rows and swaps it in.
    pub fn reload(&self, conn: &Connection) -> SchemaResult<Arc<SchemaSnapshot>> {
        let snapshot = Arc::new(read_snapshot(conn, &self.types)?);
        *self.snapshot.write() = snapshot.clone();
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn class(&self, id: ClassId) -> Option<Arc<ResourceClass>> {
        self.snapshot.read().class(id).cloned()
    }

    pub fn class_by_name(&self, name: &str) -> SchemaResult<Arc<ResourceClass>> {
        self.snapshot
            .read()
            .class_by_name(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownClass(name.to_string()))
    }

    pub fn root(&self) -> SchemaResult<Arc<ResourceClass>> {
        self.class_by_name(ROOT_CLASS)
    }

    pub fn attribute(&self, id: AttributeId) -> Option<Arc<AttributeDefinition>> {
        self.snapshot.read().attribute(id).cloned()
    }

    pub fn attribute_class(&self, type_name: &str) -> Option<Arc<AttributeClass>> {
        self.types.get(type_name).cloned()
    }

    pub fn attribute_classes(&self) -> impl Iterator<Item = &Arc<AttributeClass>> {
        self.types.values()
    }

    /// Binds `names` of `class_name`'s closure into an attribute table.
    pub fn bind(&self, class_name: &str, names: &[&str]) -> SchemaResult<AttributeTable> {
        let class = self.class_by_name(class_name)?;
        let mut attributes = Vec::with_capacity(names.len());
        for name in names {
            let attribute =
                class
                    .attribute(name)
                    .cloned()
                    .ok_or_else(|| SchemaError::UnknownAttribute {
                        class: class.name.clone(),
                        attribute: (*name).to_string(),
                    })?;
            attributes.push(attribute);
        }
        Ok(AttributeTable { class, attributes })
    }

    /// Fills every handler's preload cache. Returns the number of cached
    /// values.
    pub fn activate(&self, conn: &Connection) -> SchemaResult<usize> {
        let started_at = Instant::now();
        let mut loaded = 0;
        for attribute_class in self.types.values() {
            loaded += attribute_class.handler().activate(conn)?;
        }
        info!(
            "event=schema_activate module=schema status=ok values={} duration_ms={}",
            loaded,
            started_at.elapsed().as_millis()
        );
        Ok(loaded)
    }
}

fn ensure_root_class(conn: &Connection) -> SchemaResult<()> {
    if find_class_id(conn, ROOT_CLASS)?.is_some() {
        return Ok(());
    }
    let root = insert_class(conn, ROOT_CLASS, None, StorageKind::Builtin, true)?;
    for (name, type_name, flags) in BUILTIN_ATTRIBUTES {
        insert_attribute(conn, root, name, type_name, *flags, None, None)?;
    }
    info!("event=schema_bootstrap module=schema status=ok class={ROOT_CLASS}");
    Ok(())
}

fn read_snapshot(
    conn: &Connection,
    types: &BTreeMap<String, Arc<AttributeClass>>,
) -> SchemaResult<SchemaSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT id, name, table_name, storage, is_abstract FROM resource_classes ORDER BY id;",
    )?;
    let mut rows = stmt.query([])?;
    let mut classes = Vec::new();
    while let Some(row) = rows.next()? {
        let storage: String = row.get(3)?;
        let name: String = row.get(1)?;
        let storage = StorageKind::parse(&storage).ok_or_else(|| {
            SchemaError::InvalidDefinition(format!("class `{name}` has storage `{storage}`"))
        })?;
        classes.push(ClassRecord {
            id: ClassId(row.get(0)?),
            name,
            table_name: row.get(2)?,
            storage,
            is_abstract: row.get(4)?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT class_id, parent_id FROM class_parents ORDER BY class_id, position;",
    )?;
    let edges = stmt
        .query_map([], |row| Ok((ClassId(row.get(0)?), ClassId(row.get(1)?))))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, class_id, name, type_name, attr_index, flags, domain, column_name
         FROM attribute_definitions
         ORDER BY attr_index;",
    )?;
    let mut rows = stmt.query([])?;
    let mut attributes = Vec::new();
    while let Some(row) = rows.next()? {
        let index: i64 = row.get(4)?;
        let flags: u32 = row.get(5)?;
        attributes.push(AttributeRecord {
            id: AttributeId(row.get(0)?),
            class_id: ClassId(row.get(1)?),
            name: row.get(2)?,
            type_name: row.get(3)?,
            index: usize::try_from(index).map_err(|_| {
                SchemaError::InvalidDefinition(format!("negative attribute index {index}"))
            })?,
            flags: AttributeFlags::from_bits_truncate(flags),
            domain: row.get(6)?,
            column_name: row.get(7)?,
        });
    }

    SchemaSnapshot::build(classes, edges, attributes, types)
}

pub(crate) fn find_class_id(conn: &Connection, name: &str) -> SchemaResult<Option<ClassId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM resource_classes WHERE name = ?1;",
            [name],
            |row| row.get(0),
        )
        .optional()?
        .map(ClassId))
}

pub(crate) fn insert_class(
    conn: &Connection,
    name: &str,
    table_name: Option<&str>,
    storage: StorageKind,
    is_abstract: bool,
) -> SchemaResult<ClassId> {
    conn.execute(
        "INSERT INTO resource_classes (name, table_name, storage, is_abstract)
         VALUES (?1, ?2, ?3, ?4);",
        params![name, table_name, storage.as_str(), is_abstract],
    )?;
    Ok(ClassId(conn.last_insert_rowid()))
}

pub(crate) fn delete_class(conn: &Connection, id: ClassId) -> SchemaResult<()> {
    conn.execute("DELETE FROM class_parents WHERE parent_id = ?1;", [id.get()])?;
    conn.execute("DELETE FROM resource_classes WHERE id = ?1;", [id.get()])?;
    Ok(())
}

pub(crate) fn insert_parent(conn: &Connection, child: ClassId, parent: ClassId) -> SchemaResult<()> {
    conn.execute(
        "INSERT INTO class_parents (class_id, parent_id, position)
         VALUES (
            ?1,
            ?2,
            (SELECT COALESCE(MAX(position) + 1, 0) FROM class_parents WHERE class_id = ?1)
         );",
        params![child.get(), parent.get()],
    )?;
    Ok(())
}

pub(crate) fn delete_parent(conn: &Connection, child: ClassId, parent: ClassId) -> SchemaResult<bool> {
    let changed = conn.execute(
        "DELETE FROM class_parents WHERE class_id = ?1 AND parent_id = ?2;",
        params![child.get(), parent.get()],
    )?;
    Ok(changed > 0)
}

/// Takes the next value of the schema-wide attribute index counter.
fn next_attribute_index(conn: &Connection) -> SchemaResult<i64> {
    let index: i64 = conn.query_row(
        "SELECT value FROM schema_counters WHERE name = 'attribute_index';",
        [],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE schema_counters SET value = value + 1 WHERE name = 'attribute_index';",
        [],
    )?;
    Ok(index)
}

pub(crate) fn insert_attribute(
    conn: &Connection,
    class_id: ClassId,
    name: &str,
    type_name: &str,
    flags: AttributeFlags,
    domain: Option<&str>,
    column_name: Option<&str>,
) -> SchemaResult<AttributeId> {
    let index = next_attribute_index(conn)?;
    conn.execute(
        "INSERT INTO attribute_definitions
            (class_id, name, type_name, attr_index, flags, domain, column_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
        params![
            class_id.get(),
            name,
            type_name,
            index,
            flags.bits(),
            domain,
            column_name
        ],
    )?;
    Ok(AttributeId(conn.last_insert_rowid()))
}

pub(crate) fn delete_attribute(conn: &Connection, id: AttributeId) -> SchemaResult<()> {
    conn.execute("DELETE FROM attribute_definitions WHERE id = ?1;", [id.get()])?;
    conn.execute(
        "DELETE FROM resource_attributes WHERE attribute_id = ?1;",
        [id.get()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{insert_attribute, insert_class, insert_parent, Schema, ROOT_CLASS};
    use crate::db::open_db_in_memory;
    use crate::handler::AttributeHandlerRegistry;
    use crate::model::flags::AttributeFlags;
    use crate::model::schema::{SchemaError, StorageKind};

    #[test]
    fn load_bootstraps_root_class_once() {
        let conn = open_db_in_memory().unwrap();
        let registry = AttributeHandlerRegistry::default();
        let schema = Schema::load(&conn, &registry).unwrap();
        let root = schema.root().unwrap();
        assert_eq!(root.name, ROOT_CLASS);
        assert_eq!(root.storage, StorageKind::Builtin);
        assert!(root.is_abstract);
        assert_eq!(root.attributes.len(), 5);
        assert!(root.attributes.iter().all(|attr| attr.is_builtin()));

        let again = Schema::load(&conn, &registry).unwrap();
        assert_eq!(again.snapshot().len(), 1);
        let types: i64 = conn
            .query_row("SELECT COUNT(*) FROM attribute_types;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(types, 16);
    }

    #[test]
    fn reload_picks_up_catalog_rows_and_bind_resolves_names() {
        let conn = open_db_in_memory().unwrap();
        let schema = Schema::load(&conn, &AttributeHandlerRegistry::default()).unwrap();
        let root = schema.root().unwrap();
        let task = insert_class(&conn, "task", Some("rc_task"), StorageKind::Table, false).unwrap();
        insert_parent(&conn, task, root.id).unwrap();
        insert_attribute(&conn, task, "done", "boolean", AttributeFlags::empty(), None, None)
            .unwrap();

        assert!(schema.class_by_name("task").is_err());
        schema.reload(&conn).unwrap();
        let class = schema.class_by_name("task").unwrap();
        assert_eq!(class.attributes.len(), 6);
        assert_eq!(class.max_attribute_index, 5);

        let table = schema.bind("task", &["done", "name"]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().name, "done");
        assert!(table.attribute("name").unwrap().is_builtin());
        assert!(matches!(
            schema.bind("task", &["missing"]),
            Err(SchemaError::UnknownAttribute { .. })
        ));
    }
}
