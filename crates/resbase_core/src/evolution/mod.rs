//! Runtime schema evolution.
//!
//! # Responsibility
//! - Define and drop resource classes.
//! - Add and remove attributes and parent classes on classes that already
//!   have instances, migrating physical storage and stored values.
//! - Refresh live instances of the affected classes afterwards.
//!
//! # Invariants
//! - Every precondition is checked before the first catalog or DDL write,
//!   so a rejected call leaves storage untouched.
//! - Calls run on the caller's transaction; a failure part-way relies on
//!   its rollback.
//! - A `Table` class has a table exactly when it declares concrete
//!   attributes, and that table has a row for every instance of the class
//!   and its descendants.

use crate::db::ddl::{
    add_column, create_class_table, drop_column, drop_table, quote_identifier, table_exists,
    validate_identifier, ColumnSpec,
};
use crate::model::catalog::{self, ROOT_CLASS};
use crate::model::flags::AttributeFlags;
use crate::model::ids::{AttributeId, ClassId, ResourceId, ValueId};
use crate::model::schema::{AttributeDefinition, ResourceClass, SchemaSnapshot, StorageKind};
use crate::model::storage::NullAttributes;
use crate::model::value::{AttributeValue, RawValue};
use crate::repo::{LoadContext, RepoError, RepoResult, ResourceRepository};
use log::info;
use rusqlite::{params, Connection, Params};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Definition of an attribute to add to a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    pub type_name: String,
    pub flags: AttributeFlags,
    pub domain: Option<String>,
    /// Column override for the class table; defaults to `name`.
    pub column_name: Option<String>,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            flags: AttributeFlags::empty(),
            domain: None,
            column_name: None,
        }
    }

    pub fn flags(mut self, flags: AttributeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn required(mut self) -> Self {
        self.flags |= AttributeFlags::REQUIRED;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column_name = Some(column.into());
        self
    }
}

/// Schema changes applied against one repository.
pub struct SchemaEvolution<'a> {
    repository: &'a ResourceRepository,
}

impl<'a> SchemaEvolution<'a> {
    pub fn new(repository: &'a ResourceRepository) -> Self {
        Self { repository }
    }

    /// Creates a class under `parents`, or under the root class when none
    /// are given.
    pub fn define_class(
        &self,
        conn: &Connection,
        name: &str,
        parents: &[&str],
        storage: StorageKind,
        is_abstract: bool,
    ) -> RepoResult<Arc<ResourceClass>> {
        validate_identifier(name)?;
        if storage == StorageKind::Builtin {
            return Err(RepoError::invalid(
                "only the root class uses builtin storage",
            ));
        }
        if catalog::find_class_id(conn, name)?.is_some() {
            return Err(RepoError::invalid(format!("class `{name}` already exists")));
        }

        let schema = self.repository.schema();
        let parents = if parents.is_empty() {
            vec![schema.root()?]
        } else {
            parents
                .iter()
                .map(|parent| schema.class_by_name(parent))
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut inherited: HashMap<&str, AttributeId> = HashMap::new();
        for attribute in parents.iter().flat_map(|parent| parent.attributes.iter()) {
            match inherited.insert(attribute.name.as_str(), attribute.id) {
                Some(previous) if previous != attribute.id => {
                    return Err(RepoError::invalid(format!(
                        "parents of `{name}` both define attribute `{}`",
                        attribute.name
                    )))
                }
                _ => {}
            }
        }

        let table_name = match storage {
            StorageKind::Table => {
                let table = format!("rc_{}", name.to_ascii_lowercase());
                validate_identifier(&table)?;
                if table_exists(conn, &table)? || table_taken(conn, &table)? {
                    return Err(RepoError::invalid(format!(
                        "table `{table}` is already in use"
                    )));
                }
                Some(table)
            }
            _ => None,
        };

        let id = catalog::insert_class(conn, name, table_name.as_deref(), storage, is_abstract)?;
        for parent in &parents {
            catalog::insert_parent(conn, id, parent.id)?;
        }
        let snapshot = self.repository.schema().reload(conn)?;
        let class = class_in(&snapshot, id)?;
        info!(
            "event=schema_evolution module=evolution op=define_class class={} storage={} parents={}",
            class.name,
            storage.as_str(),
            parents.len()
        );
        Ok(class)
    }

    /// Removes a class that has neither children nor instances.
    pub fn drop_class(&self, conn: &Connection, name: &str) -> RepoResult<()> {
        let schema = self.repository.schema();
        let class = schema.class_by_name(name)?;
        if class.name == ROOT_CLASS {
            return Err(RepoError::unsupported("the root class cannot be dropped"));
        }
        if !class.children.is_empty() {
            return Err(RepoError::invalid(format!(
                "class `{name}` still has subclasses"
            )));
        }
        if !self.repository.instances_of(conn, &class)?.is_empty() {
            return Err(RepoError::invalid(format!(
                "class `{name}` still has instances"
            )));
        }

        if let Some(table) = class.table_name.as_deref() {
            if table_exists(conn, table)? {
                drop_table(conn, table)?;
            }
        }
        for attribute in &class.declared {
            catalog::delete_attribute(conn, attribute.id)?;
        }
        catalog::delete_class(conn, class.id)?;
        schema.reload(conn)?;
        info!("event=schema_evolution module=evolution op=drop_class class={name}");
        Ok(())
    }

    /// Declares a new attribute on `class_name` and migrates existing
    /// instances, giving each `initial` (unset when null).
    pub fn add_attribute(
        &self,
        conn: &Connection,
        class_name: &str,
        spec: AttributeSpec,
        initial: impl Into<RawValue>,
    ) -> RepoResult<Arc<AttributeDefinition>> {
        let schema = self.repository.schema();
        let class = schema.class_by_name(class_name)?;
        if class.storage == StorageKind::Builtin {
            return Err(RepoError::unsupported(format!(
                "attributes of `{}` are fixed",
                class.name
            )));
        }
        if spec.flags.contains(AttributeFlags::BUILTIN) {
            return Err(RepoError::invalid("builtin attributes cannot be added"));
        }
        validate_identifier(&spec.name)?;
        let column = spec.column_name.as_deref().unwrap_or(&spec.name);
        validate_identifier(column)?;
        let attribute_class = schema.attribute_class(&spec.type_name).ok_or_else(|| {
            RepoError::invalid(format!("unknown attribute type `{}`", spec.type_name))
        })?;
        let handler = attribute_class.handler();

        let snapshot = schema.snapshot();
        let family = family_of(&snapshot, &class);
        if family
            .iter()
            .any(|member| member.attribute(&spec.name).is_some())
        {
            return Err(RepoError::invalid(format!(
                "attribute `{}` already exists on `{}` or a subclass",
                spec.name, class.name
            )));
        }
        if class.concrete_declared().any(|attr| attr.column() == column) {
            return Err(RepoError::invalid(format!(
                "column `{column}` is already used by `{}`",
                class.name
            )));
        }

        let initial = handler
            .to_attribute_value(conn, initial.into())
            .map_err(|err| RepoError::attribute(&spec.name, err))?;
        if let Some(domain) = spec.domain.as_deref() {
            handler
                .check_domain(conn, domain, initial.as_ref())
                .map_err(|err| RepoError::attribute(&spec.name, err))?;
        }
        let synthetic = spec.flags.contains(AttributeFlags::SYNTHETIC);
        let instances = self.repository.instances_of(conn, &class)?;
        if spec.flags.contains(AttributeFlags::REQUIRED)
            && !synthetic
            && initial.is_none()
            && !instances.is_empty()
        {
            return Err(RepoError::ValueRequired {
                class: class.name.clone(),
                attribute: spec.name.clone(),
            });
        }

        let attribute_id = catalog::insert_attribute(
            conn,
            class.id,
            &spec.name,
            &spec.type_name,
            spec.flags,
            spec.domain.as_deref(),
            spec.column_name.as_deref(),
        )?;
        let snapshot = schema.reload(conn)?;
        let class = class_in(&snapshot, class.id)?;
        let attribute = class.attribute_by_id(attribute_id).cloned().ok_or_else(|| {
            RepoError::invariant(format!("attribute `{}` missing after reload", spec.name))
        })?;

        if attribute.is_concrete() {
            if class.storage == StorageKind::Table {
                extend_table(conn, &class, &attribute, &instances)?;
            }
            backfill(conn, &class, &attribute, initial.as_ref(), &instances)?;
        }
        info!(
            "event=schema_evolution module=evolution op=add_attribute class={} attribute={} instances={}",
            class.name,
            attribute.name,
            instances.len()
        );
        self.repository.revert_class(conn, &class)?;
        Ok(attribute)
    }

    /// Removes a declared attribute with its stored values.
    pub fn delete_attribute(
        &self,
        conn: &Connection,
        class_name: &str,
        attribute_name: &str,
    ) -> RepoResult<()> {
        let schema = self.repository.schema();
        let class = schema.class_by_name(class_name)?;
        let attribute = class
            .declared_attribute(attribute_name)
            .cloned()
            .ok_or_else(|| {
                RepoError::invalid(format!(
                    "class `{}` declares no attribute `{attribute_name}`",
                    class.name
                ))
            })?;
        if attribute.is_builtin() {
            return Err(RepoError::unsupported(format!(
                "builtin attribute `{attribute_name}` cannot be deleted"
            )));
        }

        let mut deleted_values = 0;
        if attribute.is_concrete() {
            match class.storage {
                StorageKind::Table => {
                    deleted_values = shrink_table(conn, &class, &attribute)?;
                }
                StorageKind::Dynamic => {
                    let ids = distinct_value_ids(
                        conn,
                        "SELECT DISTINCT value_id FROM resource_attributes WHERE attribute_id = ?1;",
                        params![attribute.id.get()],
                    )?;
                    deleted_values = delete_values(conn, &attribute, &ids)?;
                }
                StorageKind::Builtin => {}
            }
        }

        catalog::delete_attribute(conn, attribute.id)?;
        let snapshot = schema.reload(conn)?;
        let class = class_in(&snapshot, class.id)?;
        info!(
            "event=schema_evolution module=evolution op=delete_attribute class={} attribute={} values={}",
            class.name, attribute.name, deleted_values
        );
        self.repository.revert_class(conn, &class)?;
        Ok(())
    }

    /// Adds `parent_name` as a direct parent of `class_name` and creates the
    /// parent lineage's rows for every existing instance. `initial` supplies
    /// values for the attributes the class gains.
    pub fn add_parent_class(
        &self,
        conn: &Connection,
        class_name: &str,
        parent_name: &str,
        initial: Vec<(String, RawValue)>,
    ) -> RepoResult<()> {
        let schema = self.repository.schema();
        let old = schema.snapshot();
        let class = schema.class_by_name(class_name)?;
        let parent = schema.class_by_name(parent_name)?;
        if parent.is_a(class.id) {
            return Err(RepoError::invalid(format!(
                "`{}` derives from `{}`; adding it as a parent would form a cycle",
                parent.name, class.name
            )));
        }
        if class.is_a(parent.id) {
            return Err(RepoError::invalid(format!(
                "`{}` already derives from `{}`",
                class.name, parent.name
            )));
        }

        let lineage: HashSet<ClassId> = class.lineage_ids().into_iter().collect();
        let gained: Vec<Arc<AttributeDefinition>> = parent
            .ancestors
            .iter()
            .chain(std::iter::once(&parent))
            .filter(|member| !lineage.contains(&member.id))
            .flat_map(|member| member.declared.iter().cloned())
            .collect();
        for member in family_of(&old, &class) {
            for attribute in &gained {
                if member
                    .attribute(&attribute.name)
                    .is_some_and(|existing| existing.id != attribute.id)
                {
                    return Err(RepoError::invalid(format!(
                        "attribute `{}` of `{}` clashes with `{}`",
                        attribute.name, parent.name, member.name
                    )));
                }
            }
        }

        let mut values = HashMap::new();
        for (name, raw) in initial {
            let attribute = gained
                .iter()
                .find(|attr| attr.name == name && attr.is_concrete())
                .ok_or_else(|| {
                    RepoError::invalid(format!(
                        "`{}` gains no stored attribute `{name}`",
                        class.name
                    ))
                })?;
            let value = attribute
                .handler()
                .to_attribute_value(conn, raw)
                .map_err(|err| RepoError::attribute(&attribute.name, err))?;
            if let Some(value) = value {
                if let Some(domain) = attribute.domain.as_deref() {
                    attribute
                        .handler()
                        .check_domain(conn, domain, Some(&value))
                        .map_err(|err| RepoError::attribute(&attribute.name, err))?;
                }
                values.insert(attribute.id, value);
            }
        }
        let instances = self.repository.instances_of(conn, &class)?;
        if !instances.is_empty() {
            if let Some(missing) = gained.iter().find(|attr| {
                attr.is_concrete() && attr.is_required() && !values.contains_key(&attr.id)
            }) {
                return Err(RepoError::ValueRequired {
                    class: class.name.clone(),
                    attribute: missing.name.clone(),
                });
            }
        }

        catalog::insert_parent(conn, class.id, parent.id)?;
        let snapshot = schema.reload(conn)?;
        self.create_lineage_rows(conn, &old, &snapshot, &instances, values)?;

        let class = class_in(&snapshot, class.id)?;
        info!(
            "event=schema_evolution module=evolution op=add_parent_class class={} parent={} instances={}",
            class.name,
            parent.name,
            instances.len()
        );
        self.repository.revert_class(conn, &class)?;
        Ok(())
    }

    /// Removes `parent_name` from the direct parents of `class_name` and
    /// purges the rows of every class the instances no longer derive from.
    pub fn delete_parent_class(
        &self,
        conn: &Connection,
        class_name: &str,
        parent_name: &str,
    ) -> RepoResult<()> {
        let schema = self.repository.schema();
        let old = schema.snapshot();
        let class = schema.class_by_name(class_name)?;
        let parent = schema.class_by_name(parent_name)?;
        if !class.parents.contains(&parent.id) {
            return Err(RepoError::invalid(format!(
                "`{}` is not a direct parent of `{}`",
                parent.name, class.name
            )));
        }
        if parent.storage == StorageKind::Builtin {
            return Err(RepoError::unsupported(
                "the root class cannot be removed from a lineage",
            ));
        }

        let instances = self.repository.instances_of(conn, &class)?;
        catalog::delete_parent(conn, class.id, parent.id)?;
        if class.parents.len() == 1 {
            catalog::insert_parent(conn, class.id, schema.root()?.id)?;
        }
        let snapshot = schema.reload(conn)?;
        self.purge_lineage_rows(conn, &old, &snapshot, &instances)?;

        let class = class_in(&snapshot, class.id)?;
        info!(
            "event=schema_evolution module=evolution op=delete_parent_class class={} parent={} instances={}",
            class.name,
            parent.name,
            instances.len()
        );
        self.repository.revert_class(conn, &class)?;
        Ok(())
    }

    /// Creates rows for the classes each instance gained between `old` and
    /// `new`, one storage group at a time.
    fn create_lineage_rows(
        &self,
        conn: &Connection,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        instances: &[ResourceId],
        initial: HashMap<AttributeId, AttributeValue>,
    ) -> RepoResult<()> {
        let ctx = self.load_metas(conn, instances)?;
        let mut slots = NullAttributes::with_initial(initial);
        for id in instances {
            let mut meta = ctx
                .meta(*id)
                .cloned()
                .ok_or_else(|| RepoError::invariant(format!("{id} vanished during migration")))?;
            let gained = lineage_delta(new, old, meta.class_id)?;
            for (storage, classes) in group_by_storage(gained) {
                self.repository
                    .handlers()
                    .for_kind(storage)
                    .create(conn, &mut meta, &classes, &mut slots)?;
            }
            slots.clear_assigned();
        }
        Ok(())
    }

    /// Purges rows of the classes each instance lost between `old` and
    /// `new`, batched per concrete class.
    fn purge_lineage_rows(
        &self,
        conn: &Connection,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        instances: &[ResourceId],
    ) -> RepoResult<()> {
        let ctx = self.load_metas(conn, instances)?;
        let mut by_class: BTreeMap<ClassId, Vec<ResourceId>> = BTreeMap::new();
        for id in instances {
            if let Some(meta) = ctx.meta(*id) {
                by_class.entry(meta.class_id).or_default().push(*id);
            }
        }
        for (class_id, ids) in by_class {
            let lost = lineage_delta(old, new, class_id)?;
            for (storage, classes) in group_by_storage(lost) {
                self.repository
                    .handlers()
                    .for_kind(storage)
                    .purge(conn, &ids, &classes)?;
            }
        }
        Ok(())
    }

    fn load_metas(&self, conn: &Connection, ids: &[ResourceId]) -> RepoResult<LoadContext> {
        let mut ctx = LoadContext::new(ids.to_vec());
        self.repository
            .handlers()
            .for_kind(StorageKind::Builtin)
            .get_data(conn, &[], &mut ctx)?;
        Ok(ctx)
    }
}

fn class_in(snapshot: &SchemaSnapshot, id: ClassId) -> RepoResult<Arc<ResourceClass>> {
    snapshot
        .class(id)
        .cloned()
        .ok_or_else(|| RepoError::invariant(format!("{id} missing from the schema")))
}

fn family_of(snapshot: &SchemaSnapshot, class: &ResourceClass) -> Vec<Arc<ResourceClass>> {
    class
        .family_ids()
        .iter()
        .filter_map(|id| snapshot.class(*id).cloned())
        .collect()
}

/// Lineage members of `class_id` in `from` that are absent in `without`,
/// taken from `from`.
fn lineage_delta(
    from: &SchemaSnapshot,
    without: &SchemaSnapshot,
    class_id: ClassId,
) -> RepoResult<Vec<Arc<ResourceClass>>> {
    let class = class_in(from, class_id)?;
    let kept: HashSet<ClassId> = without
        .class(class_id)
        .map(|other| other.lineage_ids().into_iter().collect())
        .unwrap_or_default();
    Ok(class
        .ancestors
        .iter()
        .filter(|member| !kept.contains(&member.id))
        .cloned()
        .collect())
}

/// Groups classes by storage strategy in first-appearance order.
fn group_by_storage(classes: Vec<Arc<ResourceClass>>) -> Vec<(StorageKind, Vec<Arc<ResourceClass>>)> {
    let mut groups: Vec<(StorageKind, Vec<Arc<ResourceClass>>)> = Vec::new();
    for class in classes {
        match groups.iter_mut().find(|(storage, _)| *storage == class.storage) {
            Some((_, members)) => members.push(class),
            None => groups.push((class.storage, vec![class])),
        }
    }
    groups
}

fn table_taken(conn: &Connection, table: &str) -> RepoResult<bool> {
    let taken: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM resource_classes WHERE table_name = ?1);",
        [table],
        |row| row.get(0),
    )?;
    Ok(taken == 1)
}

fn class_table(class: &ResourceClass) -> RepoResult<&str> {
    class.table_name.as_deref().ok_or_else(|| {
        RepoError::invariant(format!("class `{}` has no table name", class.name))
    })
}

fn column_spec(attribute: &AttributeDefinition) -> ColumnSpec {
    let handler = attribute.handler();
    if !attribute.is_inline() {
        return ColumnSpec::new(attribute.column(), "INTEGER");
    }
    let column = ColumnSpec::new(attribute.column(), handler.column_type());
    match handler.foreign_table() {
        Some(table) => column.referencing(table),
        None => column,
    }
}

/// Adds the attribute's column, creating the class table with one row per
/// instance when this is the class's first concrete attribute.
fn extend_table(
    conn: &Connection,
    class: &ResourceClass,
    attribute: &AttributeDefinition,
    instances: &[ResourceId],
) -> RepoResult<()> {
    let table = class_table(class)?;
    if table_exists(conn, table)? {
        add_column(conn, table, &column_spec(attribute))?;
    } else {
        create_class_table(conn, table, &[column_spec(attribute)])?;
    }
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} (\"resource_id\") VALUES (?1) ON CONFLICT(\"resource_id\") DO NOTHING;",
        quote_identifier(table)?
    ))?;
    for id in instances {
        stmt.execute([id.get()])?;
    }
    Ok(())
}

/// Gives every instance `initial`: written to the column for inline
/// attributes, one value row per instance otherwise.
fn backfill(
    conn: &Connection,
    class: &ResourceClass,
    attribute: &AttributeDefinition,
    initial: Option<&AttributeValue>,
    instances: &[ResourceId],
) -> RepoResult<()> {
    let Some(initial) = initial else {
        return Ok(());
    };
    let handler = attribute.handler();
    match class.storage {
        StorageKind::Table => {
            let table = quote_identifier(class_table(class)?)?;
            let column = quote_identifier(attribute.column())?;
            if attribute.is_inline() {
                let value = handler
                    .to_column(initial)
                    .map_err(|err| RepoError::attribute(&attribute.name, err))?;
                conn.execute(&format!("UPDATE {table} SET {column} = ?1;"), [value])?;
            } else {
                let mut stmt = conn.prepare(&format!(
                    "UPDATE {table} SET {column} = ?1 WHERE \"resource_id\" = ?2;"
                ))?;
                for id in instances {
                    let value_id = handler
                        .create(conn, initial)
                        .map_err(|err| RepoError::attribute(&attribute.name, err))?;
                    stmt.execute(params![value_id.get(), id.get()])?;
                }
            }
        }
        StorageKind::Dynamic => {
            let mut stmt = conn.prepare(
                "INSERT INTO resource_attributes (resource_id, attribute_id, value_id)
                 VALUES (?1, ?2, ?3);",
            )?;
            for id in instances {
                let value_id = handler
                    .create(conn, initial)
                    .map_err(|err| RepoError::attribute(&attribute.name, err))?;
                stmt.execute(params![id.get(), attribute.id.get(), value_id.get()])?;
            }
        }
        StorageKind::Builtin => {}
    }
    Ok(())
}

/// Deletes the attribute's value rows, then its column, or the whole table
/// when no concrete attribute remains. Returns the number of value rows.
fn shrink_table(
    conn: &Connection,
    class: &ResourceClass,
    attribute: &AttributeDefinition,
) -> RepoResult<usize> {
    let table = class_table(class)?;
    if !table_exists(conn, table)? {
        return Ok(0);
    }
    let mut deleted = 0;
    if !attribute.is_inline() {
        let ids = distinct_value_ids(
            conn,
            &format!(
                "SELECT DISTINCT {column} FROM {table} WHERE {column} IS NOT NULL;",
                column = quote_identifier(attribute.column())?,
                table = quote_identifier(table)?
            ),
            params![],
        )?;
        deleted = delete_values(conn, attribute, &ids)?;
    }
    let remaining = class
        .concrete_declared()
        .filter(|attr| attr.id != attribute.id)
        .count();
    if remaining == 0 {
        drop_table(conn, table)?;
    } else {
        drop_column(conn, table, attribute.column())?;
    }
    Ok(deleted)
}

fn distinct_value_ids(conn: &Connection, sql: &str, params: impl Params) -> RepoResult<Vec<ValueId>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, i64>(0))?
        .map(|id| id.map(ValueId))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn delete_values(
    conn: &Connection,
    attribute: &AttributeDefinition,
    ids: &[ValueId],
) -> RepoResult<usize> {
    let mut deleted = 0;
    for id in ids.iter().filter(|id| id.is_stored()) {
        match attribute.handler().delete(conn, *id) {
            Ok(()) => deleted += 1,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(RepoError::attribute(&attribute.name, err)),
        }
    }
    Ok(deleted)
}
