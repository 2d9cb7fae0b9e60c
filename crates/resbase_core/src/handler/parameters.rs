//! Parameter bag handler and the keyed-parameter store it delegates to.
//!
//! # Invariants
//! - Each bag value owns exactly one parameter set.
//! - The store normalizes keys, so created bags are always re-read.

use super::domain::require_empty;
use super::{
    expect_row, require_stored, wrong_type, AttributeError, AttributeHandler, AttributeResult,
};
use crate::model::flags::Conditions;
use crate::model::ids::ValueId;
use crate::model::value::{AttributeValue, ParameterBag, RawValue};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

const TABLE: &str = "av_parameters";

/// External keyed-parameter storage.
pub trait ParameterStore: Send + Sync {
    fn create_set(&self, conn: &Connection, entries: &BTreeMap<String, String>) -> AttributeResult<i64>;

    /// Fails with `EntityNotFound` for an unknown set.
    fn load_set(&self, conn: &Connection, set_id: i64) -> AttributeResult<BTreeMap<String, String>>;

    fn replace_set(
        &self,
        conn: &Connection,
        set_id: i64,
        entries: &BTreeMap<String, String>,
    ) -> AttributeResult<()>;

    fn delete_set(&self, conn: &Connection, set_id: i64) -> AttributeResult<()>;
}

/// Parameter store over the `parameter_sets` / `parameters` tables.
///
/// Keys are trimmed; empty keys are rejected.
#[derive(Debug, Default)]
pub struct SqliteParameterStore;

impl SqliteParameterStore {
    pub fn new() -> Self {
        Self
    }

    fn normalize(entries: &BTreeMap<String, String>) -> AttributeResult<BTreeMap<String, String>> {
        let mut normalized = BTreeMap::new();
        for (key, value) in entries {
            let key = key.trim();
            if key.is_empty() {
                return Err(AttributeError::invalid("parameter keys cannot be empty"));
            }
            normalized.insert(key.to_string(), value.clone());
        }
        Ok(normalized)
    }

    fn insert_entries(
        conn: &Connection,
        set_id: i64,
        entries: &BTreeMap<String, String>,
    ) -> AttributeResult<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO parameters (set_id, param_key, param_value) VALUES (?1, ?2, ?3);",
        )?;
        for (key, value) in entries {
            stmt.execute(params![set_id, key, value])?;
        }
        Ok(())
    }

    fn require_set(conn: &Connection, set_id: i64) -> AttributeResult<()> {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM parameter_sets WHERE id = ?1);",
            [set_id],
            |row| row.get(0),
        )?;
        if exists == 1 {
            Ok(())
        } else {
            Err(AttributeError::EntityNotFound {
                entity: "parameter_sets",
                id: set_id,
            })
        }
    }
}

impl ParameterStore for SqliteParameterStore {
    fn create_set(&self, conn: &Connection, entries: &BTreeMap<String, String>) -> AttributeResult<i64> {
        let normalized = Self::normalize(entries)?;
        conn.execute("INSERT INTO parameter_sets DEFAULT VALUES;", [])?;
        let set_id = conn.last_insert_rowid();
        Self::insert_entries(conn, set_id, &normalized)?;
        Ok(set_id)
    }

    fn load_set(&self, conn: &Connection, set_id: i64) -> AttributeResult<BTreeMap<String, String>> {
        Self::require_set(conn, set_id)?;
        let mut stmt = conn.prepare(
            "SELECT param_key, param_value FROM parameters WHERE set_id = ?1 ORDER BY param_key;",
        )?;
        let mut rows = stmt.query([set_id])?;
        let mut entries = BTreeMap::new();
        while let Some(row) = rows.next()? {
            entries.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(entries)
    }

    fn replace_set(
        &self,
        conn: &Connection,
        set_id: i64,
        entries: &BTreeMap<String, String>,
    ) -> AttributeResult<()> {
        let normalized = Self::normalize(entries)?;
        Self::require_set(conn, set_id)?;
        conn.execute("DELETE FROM parameters WHERE set_id = ?1;", [set_id])?;
        Self::insert_entries(conn, set_id, &normalized)
    }

    fn delete_set(&self, conn: &Connection, set_id: i64) -> AttributeResult<()> {
        let changed = conn.execute("DELETE FROM parameter_sets WHERE id = ?1;", [set_id])?;
        if changed == 0 {
            return Err(AttributeError::EntityNotFound {
                entity: "parameter_sets",
                id: set_id,
            });
        }
        Ok(())
    }
}

/// Composite handler for `ParameterBag` values.
pub struct ParameterHandler {
    store: Arc<dyn ParameterStore>,
}

impl ParameterHandler {
    pub fn new(store: Arc<dyn ParameterStore>) -> Self {
        Self { store }
    }

    fn bag(value: &AttributeValue) -> AttributeResult<&ParameterBag> {
        match value {
            AttributeValue::Parameters(bag) => Ok(bag),
            other => Err(wrong_type("parameters", other)),
        }
    }

    fn set_id(conn: &Connection, id: ValueId) -> AttributeResult<i64> {
        require_stored(TABLE, id)?;
        conn.query_row(
            "SELECT set_id FROM av_parameters WHERE value_id = ?1;",
            [id.get()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(AttributeError::EntityNotFound {
            entity: TABLE,
            id: id.get(),
        })
    }

    /// Parses `key=value` pairs separated by `;`.
    fn parse(text: &str) -> AttributeResult<ParameterBag> {
        let mut entries = BTreeMap::new();
        for pair in text.split(';').filter(|pair| !pair.trim().is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                AttributeError::invalid(format!("parameter `{pair}` is not `key=value`"))
            })?;
            entries.insert(key.trim().to_string(), value.to_string());
        }
        Ok(ParameterBag::from_entries(entries))
    }
}

impl AttributeHandler for ParameterHandler {
    fn type_name(&self) -> &'static str {
        "parameters"
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

    fn should_retrieve_after_create(&self) -> bool {
        true
    }

    fn supported_conditions(&self) -> Conditions {
        Conditions::empty()
    }

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId> {
        let set_id = self.store.create_set(conn, Self::bag(value)?.entries())?;
        conn.execute("INSERT INTO av_parameters (set_id) VALUES (?1);", [set_id])?;
        Ok(ValueId(conn.last_insert_rowid()))
    }

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue> {
        let set_id = Self::set_id(conn, id)?;
        let entries = self.store.load_set(conn, set_id)?;
        Ok(AttributeValue::Parameters(ParameterBag::from_entries(entries)))
    }

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()> {
        let bag = Self::bag(value)?;
        let set_id = Self::set_id(conn, id)?;
        self.store.replace_set(conn, set_id, bag.entries())
    }

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()> {
        let set_id = Self::set_id(conn, id)?;
        let changed = conn.execute("DELETE FROM av_parameters WHERE value_id = ?1;", [id.get()])?;
        expect_row(changed, TABLE, id)?;
        self.store.delete_set(conn, set_id)
    }

    fn to_attribute_value(
        &self,
        _conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>> {
        match raw {
            RawValue::Null => Ok(None),
            RawValue::Value(AttributeValue::Parameters(bag)) => {
                Ok(Some(AttributeValue::Parameters(bag)))
            }
            RawValue::Value(other) => Err(wrong_type("parameters", &other)),
            RawValue::Text(text) => Self::parse(&text).map(|bag| Some(AttributeValue::Parameters(bag))),
            other => Err(AttributeError::invalid(format!("{other:?} is not a parameter bag"))),
        }
    }

    fn check_domain(
        &self,
        _conn: &Connection,
        domain: &str,
        _value: Option<&AttributeValue>,
    ) -> AttributeResult<()> {
        require_empty("parameters", domain)
    }

    fn is_value_modified(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::Parameters(bag) if bag.is_dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::{ParameterHandler, ParameterStore, SqliteParameterStore};
    use crate::db::open_db_in_memory;
    use crate::handler::{AttributeError, AttributeHandler};
    use crate::model::value::{AttributeValue, ParameterBag, RawValue};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn store_trims_keys_and_rejects_empty_ones() {
        let conn = open_db_in_memory().unwrap();
        let store = SqliteParameterStore::new();
        let mut entries = BTreeMap::new();
        entries.insert("  color ".to_string(), "red".to_string());
        let set_id = store.create_set(&conn, &entries).unwrap();
        let loaded = store.load_set(&conn, set_id).unwrap();
        assert_eq!(loaded.get("color").map(String::as_str), Some("red"));

        entries.insert(" ".to_string(), "x".to_string());
        assert!(matches!(
            store.create_set(&conn, &entries),
            Err(AttributeError::InvalidArgument(_))
        ));
        assert!(store.load_set(&conn, 999).is_err());
    }

    #[test]
    fn handler_round_trips_normalized_bag() {
        let conn = open_db_in_memory().unwrap();
        let handler = ParameterHandler::new(Arc::new(SqliteParameterStore::new()));
        let value = handler
            .to_attribute_value(&conn, RawValue::from(" a =1; b=2"))
            .unwrap()
            .unwrap();
        let id = handler.create(&conn, &value).unwrap();
        let stored = handler.retrieve(&conn, id).unwrap();
        let expected: ParameterBag = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(stored, AttributeValue::Parameters(expected));

        handler.delete(&conn, id).unwrap();
        assert!(handler.retrieve(&conn, id).unwrap_err().is_not_found());
        let sets: i64 = conn
            .query_row("SELECT COUNT(*) FROM parameter_sets;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sets, 0);
    }
}
