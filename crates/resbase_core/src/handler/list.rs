//! Ordered resource reference lists.
//!
//! Strong lists fail with `EntityNotFound` when a stored element no longer
//! resolves; weak lists drop such elements silently on read and conversion.

use super::reference::{EntityResolver, ResourceResolver};
use super::{expect_row, require_stored, wrong_type, AttributeError, AttributeHandler, AttributeResult};
use crate::model::flags::Conditions;
use crate::model::ids::{ResourceId, ValueId};
use crate::model::value::{AttributeValue, RawValue};
use rusqlite::{params, Connection, OptionalExtension};

const TABLE: &str = "av_resource_list";

#[derive(Debug, Default)]
pub struct ResourceListHandler {
    weak: bool,
    resolver: ResourceResolver,
}

impl ResourceListHandler {
    pub fn strong() -> Self {
        Self {
            weak: false,
            resolver: ResourceResolver,
        }
    }

    pub fn weak() -> Self {
        Self {
            weak: true,
            resolver: ResourceResolver,
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    fn ids(value: &AttributeValue) -> AttributeResult<&[ResourceId]> {
        match value {
            AttributeValue::ResourceList(ids) => Ok(ids),
            other => Err(wrong_type("resource_list", other)),
        }
    }

    fn insert_items(conn: &Connection, id: ValueId, items: &[ResourceId]) -> AttributeResult<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO av_resource_list_items (value_id, position, resource_id) VALUES (?1, ?2, ?3);",
        )?;
        for (position, item) in items.iter().enumerate() {
            let position = i64::try_from(position)
                .map_err(|_| AttributeError::invalid("resource list is too long"))?;
            stmt.execute(params![id.get(), position, item.get()])?;
        }
        Ok(())
    }

    /// Resolves one element; weak lists turn a missing target into `None`.
    fn resolve(&self, conn: &Connection, raw: &str) -> AttributeResult<Option<ResourceId>> {
        match self.resolver.instantiate_name(conn, raw) {
            Ok(id) => Ok(Some(ResourceId(id))),
            Err(err) if self.weak && err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn resolve_id(&self, conn: &Connection, id: ResourceId) -> AttributeResult<Option<ResourceId>> {
        match self.resolver.instantiate(conn, id.get()) {
            Ok(_) => Ok(Some(id)),
            Err(err) if self.weak && err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn resolve_all(&self, conn: &Connection, ids: Vec<ResourceId>) -> AttributeResult<AttributeValue> {
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(id) = self.resolve_id(conn, id)? {
                resolved.push(id);
            }
        }
        Ok(AttributeValue::ResourceList(resolved))
    }
}

impl AttributeHandler for ResourceListHandler {
    fn type_name(&self) -> &'static str {
        if self.weak {
            "weak_resource_list"
        } else {
            "resource_list"
        }
    }

    fn value_table(&self) -> &'static str {
        TABLE
    }

    fn column_type(&self) -> &'static str {
        "INTEGER"
    }

    fn supports_external_string(&self) -> bool {
        false
    }

    fn is_composite(&self) -> bool {
        true
    }

    fn supported_conditions(&self) -> Conditions {
        Conditions::EQUALITY
    }

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId> {
        let items = Self::ids(value)?;
        conn.execute(
            "INSERT INTO av_resource_list (size) VALUES (?1);",
            [items.len() as i64],
        )?;
        let id = ValueId(conn.last_insert_rowid());
        Self::insert_items(conn, id, items)?;
        Ok(id)
    }

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue> {
        require_stored(TABLE, id)?;
        let size: Option<i64> = conn
            .query_row(
                "SELECT size FROM av_resource_list WHERE value_id = ?1;",
                [id.get()],
                |row| row.get(0),
            )
            .optional()?;
        let size = size.ok_or(AttributeError::EntityNotFound {
            entity: TABLE,
            id: id.get(),
        })?;

        let mut stmt = conn.prepare(
            "SELECT items.resource_id, resources.id IS NOT NULL
             FROM av_resource_list_items AS items
             LEFT JOIN resources ON resources.id = items.resource_id
             WHERE items.value_id = ?1
             ORDER BY items.position;",
        )?;
        let mut rows = stmt.query([id.get()])?;
        let mut items = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        while let Some(row) = rows.next()? {
            let target: i64 = row.get(0)?;
            let exists: bool = row.get(1)?;
            if exists {
                items.push(ResourceId(target));
            } else if !self.weak {
                return Err(AttributeError::EntityNotFound {
                    entity: "resources",
                    id: target,
                });
            }
        }
        Ok(AttributeValue::ResourceList(items))
    }

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()> {
        require_stored(TABLE, id)?;
        let items = Self::ids(value)?;
        let changed = conn.execute(
            "UPDATE av_resource_list SET size = ?1 WHERE value_id = ?2;",
            params![items.len() as i64, id.get()],
        )?;
        expect_row(changed, TABLE, id)?;
        conn.execute(
            "DELETE FROM av_resource_list_items WHERE value_id = ?1;",
            [id.get()],
        )?;
        Self::insert_items(conn, id, items)
    }

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()> {
        require_stored(TABLE, id)?;
        conn.execute(
            "DELETE FROM av_resource_list_items WHERE value_id = ?1;",
            [id.get()],
        )?;
        let changed = conn.execute("DELETE FROM av_resource_list WHERE value_id = ?1;", [id.get()])?;
        expect_row(changed, TABLE, id)
    }

    fn to_attribute_value(
        &self,
        conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>> {
        match raw {
            RawValue::Null => Ok(None),
            RawValue::Value(AttributeValue::ResourceList(ids)) => self.resolve_all(conn, ids).map(Some),
            RawValue::Value(AttributeValue::Resource(id)) => self.resolve_all(conn, vec![id]).map(Some),
            RawValue::Value(other) => Err(wrong_type("resource_list", &other)),
            RawValue::Integer(id) => self.resolve_all(conn, vec![ResourceId(id)]).map(Some),
            RawValue::Text(text) => {
                let mut items = Vec::new();
                for element in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    if let Some(id) = self.resolve(conn, element)? {
                        items.push(id);
                    }
                }
                Ok(Some(AttributeValue::ResourceList(items)))
            }
            RawValue::Boolean(_) => Err(AttributeError::invalid("a boolean is not a resource list")),
        }
    }

    /// Domain is a class name every element must be an instance of.
    fn check_domain(
        &self,
        conn: &Connection,
        domain: &str,
        value: Option<&AttributeValue>,
    ) -> AttributeResult<()> {
        self.resolver.check_domain(conn, domain, None)?;
        let Some(value) = value else {
            return Ok(());
        };
        for id in Self::ids(value)? {
            self.resolver.check_domain(conn, domain, Some(id.get()))?;
        }
        Ok(())
    }

    fn contains_resource_references(&self) -> bool {
        true
    }

    fn resource_references(&self, value: &AttributeValue) -> Vec<ResourceId> {
        Self::ids(value).map(<[ResourceId]>::to_vec).unwrap_or_default()
    }

    fn clear_resource_references(&self, value: &mut AttributeValue, targets: &[ResourceId]) -> bool {
        let AttributeValue::ResourceList(ids) = value else {
            return false;
        };
        let before = ids.len();
        if targets.is_empty() {
            ids.clear();
        } else {
            ids.retain(|id| !targets.contains(id));
        }
        ids.len() != before
    }
}
