//! Resource handlers: one storage strategy per group of classes.
//!
//! # Responsibility
//! - Write, read, update and delete the rows a strategy owns for a set of
//!   classes of one instance.
//! - Load shared data for many instances into a `LoadContext` once.
//!
//! # Invariants
//! - The builtin handler runs first on create and last on delete.
//! - A `Table` class has a table exactly when it declares concrete
//!   attributes; classes without one are skipped.
//! - Off-row value rows are deleted before the row that links them.

use crate::db::ddl::quote_identifier;
use crate::handler::AttributeError;
use crate::model::ids::{AttributeId, ResourceId, SubjectId, ValueId};
use crate::model::resource::ResourceMeta;
use crate::model::schema::{AttributeDefinition, ResourceClass, StorageKind};
use crate::model::storage::{AttributeSlots, AttributeStorage};
use crate::repo::context::{ClassRow, LoadContext};
use crate::repo::{RepoError, RepoResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::Arc;

/// Ids per `IN (...)` query.
const ID_CHUNK: usize = 500;

/// Persistence strategy for the classes of one partition.
pub trait ResourceHandler: Send + Sync {
    fn strategy(&self) -> StorageKind;

    /// Writes the rows for `classes`, taking values from `slots` and
    /// recording the value ids it assigns.
    fn create(
        &self,
        conn: &Connection,
        meta: &mut ResourceMeta,
        classes: &[Arc<ResourceClass>],
        slots: &mut dyn AttributeSlots,
    ) -> RepoResult<()>;

    /// Reads what `classes` need for every id of `ctx`, unless already read.
    fn get_data(
        &self,
        conn: &Connection,
        classes: &[Arc<ResourceClass>],
        ctx: &mut LoadContext,
    ) -> RepoResult<()>;

    /// Copies one instance's data from `ctx` into `storage`.
    fn apply(
        &self,
        ctx: &LoadContext,
        classes: &[Arc<ResourceClass>],
        id: ResourceId,
        storage: &mut AttributeStorage,
    ) -> RepoResult<()>;

    /// Persists modified attributes of `classes`.
    fn update(
        &self,
        conn: &Connection,
        meta: &ResourceMeta,
        classes: &[Arc<ResourceClass>],
        storage: &mut AttributeStorage,
    ) -> RepoResult<()>;

    /// Deletes off-row values still set, then the instance's own rows.
    fn delete(
        &self,
        conn: &Connection,
        id: ResourceId,
        classes: &[Arc<ResourceClass>],
        storage: &AttributeStorage,
    ) -> RepoResult<()>;

    /// Removes everything `classes` store for `ids`.
    fn purge(
        &self,
        conn: &Connection,
        ids: &[ResourceId],
        classes: &[Arc<ResourceClass>],
    ) -> RepoResult<()> {
        let mut ctx = LoadContext::new(ids.to_vec());
        self.get_data(conn, classes, &mut ctx)?;
        let slots = classes
            .iter()
            .flat_map(|class| class.declared.iter())
            .map(|attr| attr.index + 1)
            .max()
            .unwrap_or(0);
        for id in ids {
            let mut storage = AttributeStorage::with_slots(slots);
            self.apply(&ctx, classes, *id, &mut storage)?;
            self.delete(conn, *id, classes, &storage)?;
        }
        Ok(())
    }
}

/// The three strategies, addressed by `StorageKind`.
pub struct ResourceHandlers {
    builtin: BuiltinResourceHandler,
    table: TableResourceHandler,
    dynamic: DynamicResourceHandler,
}

impl ResourceHandlers {
    pub fn new() -> Self {
        Self {
            builtin: BuiltinResourceHandler,
            table: TableResourceHandler,
            dynamic: DynamicResourceHandler,
        }
    }

    pub fn for_kind(&self, kind: StorageKind) -> &dyn ResourceHandler {
        match kind {
            StorageKind::Builtin => &self.builtin,
            StorageKind::Table => &self.table,
            StorageKind::Dynamic => &self.dynamic,
        }
    }
}

impl Default for ResourceHandlers {
    fn default() -> Self {
        Self::new()
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Deletes one off-row value; a value that is already gone is not an error.
fn delete_value(conn: &Connection, attribute: &AttributeDefinition, id: ValueId) -> RepoResult<()> {
    if !id.is_stored() {
        return Ok(());
    }
    match attribute.handler().delete(conn, id) {
        Ok(()) => Ok(()),
        Err(AttributeError::EntityNotFound { .. }) => Ok(()),
        Err(err) => Err(RepoError::attribute(&attribute.name, err)),
    }
}

/// Creates the off-row value for `value` and records its id.
fn create_value<S: AttributeSlots + ?Sized>(
    conn: &Connection,
    attribute: &AttributeDefinition,
    value: &crate::model::value::AttributeValue,
    slots: &mut S,
) -> RepoResult<ValueId> {
    let handler = attribute.handler();
    let id = handler
        .create(conn, value)
        .map_err(|err| RepoError::attribute(&attribute.name, err))?;
    slots.set_value_id(attribute, id);
    if handler.should_retrieve_after_create() {
        let stored = handler.retrieve(conn, id).map_err(RepoError::internal)?;
        slots.replace_value(attribute, stored);
    }
    Ok(id)
}

/// Brings one modified off-row value in line with storage: create, update
/// or delete its value row. Returns the resulting value id.
fn persist_value(
    conn: &Connection,
    attribute: &AttributeDefinition,
    storage: &mut AttributeStorage,
) -> RepoResult<ValueId> {
    let current = storage.value_id(attribute.index);
    let value = storage.value(attribute.index).cloned();
    let id = match value {
        Some(value) if current.is_stored() => {
            attribute
                .handler()
                .update(conn, current, &value)
                .map_err(|err| RepoError::attribute(&attribute.name, err))?;
            current
        }
        Some(value) => create_value(conn, attribute, &value, storage)?,
        None => {
            delete_value(conn, attribute, current)?;
            ValueId::UNSET
        }
    };
    storage.set_value_id(attribute.index, id);
    Ok(id)
}

/// Root class strategy over the `resources` metadata table.
#[derive(Debug, Default)]
pub struct BuiltinResourceHandler;

impl ResourceHandler for BuiltinResourceHandler {
    fn strategy(&self) -> StorageKind {
        StorageKind::Builtin
    }

    fn create(
        &self,
        conn: &Connection,
        meta: &mut ResourceMeta,
        _classes: &[Arc<ResourceClass>],
        _slots: &mut dyn AttributeSlots,
    ) -> RepoResult<()> {
        conn.execute(
            "INSERT INTO resources (class_id, name, owner_id, parent_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                meta.class_id.get(),
                meta.name,
                meta.owner.map(SubjectId::get),
                meta.parent.map(ResourceId::get),
                meta.created_at,
                meta.modified_at
            ],
        )?;
        meta.id = ResourceId(conn.last_insert_rowid());
        Ok(())
    }

    fn get_data(
        &self,
        conn: &Connection,
        _classes: &[Arc<ResourceClass>],
        ctx: &mut LoadContext,
    ) -> RepoResult<()> {
        if ctx.has_meta() {
            return Ok(());
        }
        let mut loaded = HashMap::new();
        let ids = ctx.ids().to_vec();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, class_id, name, owner_id, parent_id, created_at, modified_at
                 FROM resources
                 WHERE id IN ({});",
                placeholders(chunk.len())
            ))?;
            let mut rows = stmt.query(params_from_iter(chunk.iter().map(|id| id.get())))?;
            while let Some(row) = rows.next()? {
                let meta = ResourceMeta {
                    id: ResourceId(row.get(0)?),
                    class_id: row.get::<_, i64>(1)?.into(),
                    name: row.get(2)?,
                    owner: row.get::<_, Option<i64>>(3)?.map(SubjectId),
                    parent: row.get::<_, Option<i64>>(4)?.map(ResourceId),
                    created_at: row.get(5)?,
                    modified_at: row.get(6)?,
                };
                loaded.insert(meta.id, meta);
            }
            ctx.record_read();
        }
        ctx.set_meta(loaded);
        Ok(())
    }

    fn apply(
        &self,
        ctx: &LoadContext,
        _classes: &[Arc<ResourceClass>],
        id: ResourceId,
        _storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        match ctx.meta(id) {
            Some(_) => Ok(()),
            None => Err(RepoError::EntityNotFound {
                entity: "resources",
                id: id.get(),
            }),
        }
    }

    fn update(
        &self,
        conn: &Connection,
        meta: &ResourceMeta,
        _classes: &[Arc<ResourceClass>],
        _storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        let changed = conn.execute(
            "UPDATE resources
             SET name = ?1, owner_id = ?2, parent_id = ?3, modified_at = ?4
             WHERE id = ?5;",
            params![
                meta.name,
                meta.owner.map(SubjectId::get),
                meta.parent.map(ResourceId::get),
                meta.modified_at,
                meta.id.get()
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::EntityNotFound {
                entity: "resources",
                id: meta.id.get(),
            });
        }
        Ok(())
    }

    fn delete(
        &self,
        conn: &Connection,
        id: ResourceId,
        _classes: &[Arc<ResourceClass>],
        _storage: &AttributeStorage,
    ) -> RepoResult<()> {
        let changed = conn.execute("DELETE FROM resources WHERE id = ?1;", [id.get()])?;
        if changed == 0 {
            return Err(RepoError::EntityNotFound {
                entity: "resources",
                id: id.get(),
            });
        }
        Ok(())
    }

    fn purge(
        &self,
        _conn: &Connection,
        _ids: &[ResourceId],
        _classes: &[Arc<ResourceClass>],
    ) -> RepoResult<()> {
        Err(RepoError::unsupported(
            "the root class cannot be removed from a lineage",
        ))
    }
}

/// One table per class, one column per concrete attribute.
///
/// Inline attributes hold the value itself; off-row attributes hold the
/// value id.
#[derive(Debug, Default)]
pub struct TableResourceHandler;

impl TableResourceHandler {
    fn stored_classes(classes: &[Arc<ResourceClass>]) -> impl Iterator<Item = &Arc<ResourceClass>> {
        classes.iter().filter(|class| class.has_concrete_attributes())
    }

    fn table(class: &ResourceClass) -> RepoResult<String> {
        let table = class.table_name.as_deref().ok_or_else(|| {
            RepoError::invariant(format!("class `{}` has no table name", class.name))
        })?;
        Ok(quote_identifier(table)?)
    }

    /// Column value for an inline attribute, recording `INLINE`/`UNSET`.
    fn inline_column<S: AttributeSlots + ?Sized>(
        attribute: &AttributeDefinition,
        slots: &mut S,
    ) -> RepoResult<SqlValue> {
        match slots.value(attribute) {
            Some(value) => {
                let column = attribute
                    .handler()
                    .to_column(&value)
                    .map_err(|err| RepoError::attribute(&attribute.name, err))?;
                slots.set_value_id(attribute, ValueId::INLINE);
                Ok(column)
            }
            None => {
                slots.set_value_id(attribute, ValueId::UNSET);
                Ok(SqlValue::Null)
            }
        }
    }

    fn id_column(id: ValueId) -> SqlValue {
        if id.is_stored() {
            SqlValue::Integer(id.get())
        } else {
            SqlValue::Null
        }
    }

    fn upsert(
        conn: &Connection,
        class: &ResourceClass,
        id: ResourceId,
        columns: Vec<(String, SqlValue)>,
    ) -> RepoResult<()> {
        let table = Self::table(class)?;
        let mut names = vec!["\"resource_id\"".to_string()];
        let mut assignments = Vec::with_capacity(columns.len());
        let mut values = vec![SqlValue::Integer(id.get())];
        for (column, value) in columns {
            let quoted = quote_identifier(&column)?;
            assignments.push(format!("{quoted} = excluded.{quoted}"));
            names.push(quoted);
            values.push(value);
        }
        let conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        conn.execute(
            &format!(
                "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(\"resource_id\") {conflict};",
                names.join(", "),
                placeholders(values.len())
            ),
            params_from_iter(values),
        )?;
        Ok(())
    }
}

impl ResourceHandler for TableResourceHandler {
    fn strategy(&self) -> StorageKind {
        StorageKind::Table
    }

    fn create(
        &self,
        conn: &Connection,
        meta: &mut ResourceMeta,
        classes: &[Arc<ResourceClass>],
        slots: &mut dyn AttributeSlots,
    ) -> RepoResult<()> {
        for class in Self::stored_classes(classes) {
            let mut columns = Vec::new();
            for attribute in class.concrete_declared() {
                let column = if attribute.is_inline() {
                    Self::inline_column(attribute, slots)?
                } else {
                    match slots.value(attribute) {
                        Some(value) => Self::id_column(create_value(conn, attribute, &value, slots)?),
                        None => SqlValue::Null,
                    }
                };
                columns.push((attribute.column().to_string(), column));
            }
            Self::upsert(conn, class, meta.id, columns)?;
        }
        Ok(())
    }

    fn get_data(
        &self,
        conn: &Connection,
        classes: &[Arc<ResourceClass>],
        ctx: &mut LoadContext,
    ) -> RepoResult<()> {
        let ids = ctx.ids().to_vec();
        for class in Self::stored_classes(classes) {
            if ctx.has_rows(class.id) {
                continue;
            }
            let table = Self::table(class)?;
            let mut loaded = HashMap::new();
            for chunk in ids.chunks(ID_CHUNK) {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {table} WHERE \"resource_id\" IN ({});",
                    placeholders(chunk.len())
                ))?;
                let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
                let mut rows = stmt.query(params_from_iter(chunk.iter().map(|id| id.get())))?;
                while let Some(row) = rows.next()? {
                    let mut values = ClassRow::new();
                    let mut owner = None;
                    for (position, name) in names.iter().enumerate() {
                        let value: SqlValue = row.get(position)?;
                        if name == "resource_id" {
                            if let SqlValue::Integer(id) = value {
                                owner = Some(ResourceId(id));
                            }
                        } else {
                            values.insert(name.clone(), value);
                        }
                    }
                    if let Some(owner) = owner {
                        loaded.insert(owner, values);
                    }
                }
                ctx.record_read();
            }
            ctx.set_rows(class.id, loaded);
        }
        Ok(())
    }

    fn apply(
        &self,
        ctx: &LoadContext,
        classes: &[Arc<ResourceClass>],
        id: ResourceId,
        storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        for class in Self::stored_classes(classes) {
            let row = ctx.row(class.id, id);
            for attribute in class.concrete_declared() {
                let column = row
                    .and_then(|row| row.get(attribute.column()))
                    .cloned()
                    .unwrap_or(SqlValue::Null);
                match (column, attribute.is_inline()) {
                    (SqlValue::Null, _) => {
                        storage.set_value(attribute.index, None);
                        storage.set_value_id(attribute.index, ValueId::UNSET);
                    }
                    (column, true) => {
                        let value = attribute
                            .handler()
                            .from_column(column)
                            .map_err(RepoError::internal)?;
                        storage.set_value(attribute.index, Some(value));
                        storage.set_value_id(attribute.index, ValueId::INLINE);
                    }
                    (SqlValue::Integer(value_id), false) => {
                        storage.set_value(attribute.index, None);
                        storage.set_value_id(attribute.index, ValueId(value_id));
                    }
                    (other, false) => {
                        return Err(RepoError::invariant(format!(
                            "column `{}` of `{}` holds {:?} instead of a value id",
                            attribute.column(),
                            class.name,
                            other.data_type()
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn update(
        &self,
        conn: &Connection,
        meta: &ResourceMeta,
        classes: &[Arc<ResourceClass>],
        storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        for class in Self::stored_classes(classes) {
            let mut columns = Vec::new();
            for attribute in class.concrete_declared() {
                if !storage.is_attribute_modified(attribute) {
                    continue;
                }
                let column = if attribute.is_inline() {
                    Self::inline_column(attribute.as_ref(), storage)?
                } else {
                    Self::id_column(persist_value(conn, attribute, storage)?)
                };
                columns.push((attribute.column().to_string(), column));
            }
            if !columns.is_empty() {
                Self::upsert(conn, class, meta.id, columns)?;
            }
        }
        Ok(())
    }

    fn delete(
        &self,
        conn: &Connection,
        id: ResourceId,
        classes: &[Arc<ResourceClass>],
        storage: &AttributeStorage,
    ) -> RepoResult<()> {
        for class in Self::stored_classes(classes) {
            for attribute in class.concrete_declared().filter(|attr| !attr.is_inline()) {
                delete_value(conn, attribute, storage.value_id(attribute.index))?;
            }
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE \"resource_id\" = ?1;",
                    Self::table(class)?
                ),
                [id.get()],
            )?;
        }
        Ok(())
    }
}

/// Values in side tables, linked through `resource_attributes`.
#[derive(Debug, Default)]
pub struct DynamicResourceHandler;

impl DynamicResourceHandler {
    fn link(conn: &Connection, id: ResourceId, attribute: AttributeId, value: ValueId) -> RepoResult<()> {
        conn.execute(
            "INSERT INTO resource_attributes (resource_id, attribute_id, value_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(resource_id, attribute_id) DO UPDATE SET value_id = excluded.value_id;",
            params![id.get(), attribute.get(), value.get()],
        )?;
        Ok(())
    }

    fn unlink(conn: &Connection, id: ResourceId, attribute: AttributeId) -> RepoResult<()> {
        conn.execute(
            "DELETE FROM resource_attributes WHERE resource_id = ?1 AND attribute_id = ?2;",
            params![id.get(), attribute.get()],
        )?;
        Ok(())
    }
}

impl ResourceHandler for DynamicResourceHandler {
    fn strategy(&self) -> StorageKind {
        StorageKind::Dynamic
    }

    fn create(
        &self,
        conn: &Connection,
        meta: &mut ResourceMeta,
        classes: &[Arc<ResourceClass>],
        slots: &mut dyn AttributeSlots,
    ) -> RepoResult<()> {
        for attribute in classes.iter().flat_map(|class| class.concrete_declared()) {
            if let Some(value) = slots.value(attribute) {
                let value_id = create_value(conn, attribute, &value, slots)?;
                Self::link(conn, meta.id, attribute.id, value_id)?;
            }
        }
        Ok(())
    }

    fn get_data(
        &self,
        conn: &Connection,
        _classes: &[Arc<ResourceClass>],
        ctx: &mut LoadContext,
    ) -> RepoResult<()> {
        if ctx.has_dynamic() {
            return Ok(());
        }
        let mut links: HashMap<ResourceId, HashMap<AttributeId, ValueId>> = HashMap::new();
        let ids = ctx.ids().to_vec();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut stmt = conn.prepare(&format!(
                "SELECT resource_id, attribute_id, value_id
                 FROM resource_attributes
                 WHERE resource_id IN ({});",
                placeholders(chunk.len())
            ))?;
            let mut rows = stmt.query(params_from_iter(chunk.iter().map(|id| id.get())))?;
            while let Some(row) = rows.next()? {
                links
                    .entry(ResourceId(row.get(0)?))
                    .or_default()
                    .insert(AttributeId(row.get(1)?), ValueId(row.get(2)?));
            }
            ctx.record_read();
        }
        ctx.set_dynamic(links);
        Ok(())
    }

    fn apply(
        &self,
        ctx: &LoadContext,
        classes: &[Arc<ResourceClass>],
        id: ResourceId,
        storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        for attribute in classes.iter().flat_map(|class| class.concrete_declared()) {
            storage.set_value(attribute.index, None);
            storage.set_value_id(attribute.index, ctx.dynamic_value_id(id, attribute.id));
        }
        Ok(())
    }

    fn update(
        &self,
        conn: &Connection,
        meta: &ResourceMeta,
        classes: &[Arc<ResourceClass>],
        storage: &mut AttributeStorage,
    ) -> RepoResult<()> {
        for attribute in classes.iter().flat_map(|class| class.concrete_declared()) {
            if !storage.is_attribute_modified(attribute) {
                continue;
            }
            let value_id = persist_value(conn, attribute, storage)?;
            if value_id.is_stored() {
                Self::link(conn, meta.id, attribute.id, value_id)?;
            } else {
                Self::unlink(conn, meta.id, attribute.id)?;
            }
        }
        Ok(())
    }

    fn delete(
        &self,
        conn: &Connection,
        id: ResourceId,
        classes: &[Arc<ResourceClass>],
        storage: &AttributeStorage,
    ) -> RepoResult<()> {
        for attribute in classes.iter().flat_map(|class| class.concrete_declared()) {
            delete_value(conn, attribute, storage.value_id(attribute.index))?;
            Self::unlink(conn, id, attribute.id)?;
        }
        Ok(())
    }
}
