//! Schema use-case service.
//!
//! # Responsibility
//! - Run class definition and schema evolution calls inside a transaction.
//! - Bring the in-memory schema and live instances back in line with
//!   storage when a call fails.
//!
//! # Invariants
//! - After a failed call that owned its transaction, the schema snapshot
//!   and every live instance reflect the rolled-back storage state.
//! - When a call joins the caller's transaction, the caller rolls back and
//!   then calls `resync`.

use super::logged;
use crate::db::with_transaction;
use crate::evolution::{AttributeSpec, SchemaEvolution};
use crate::model::catalog::ROOT_CLASS;
use crate::model::schema::{AttributeDefinition, ResourceClass, StorageKind};
use crate::model::value::RawValue;
use crate::repo::{RepoError, RepoResult, ResourceRepository, RevertReport};
use log::warn;
use rusqlite::Connection;
use std::sync::Arc;

pub struct SchemaService<'a> {
    conn: &'a Connection,
    repository: &'a ResourceRepository,
}

impl<'a> SchemaService<'a> {
    pub fn new(conn: &'a Connection, repository: &'a ResourceRepository) -> Self {
        Self { conn, repository }
    }

    pub fn define_class(
        &self,
        name: &str,
        parents: &[&str],
        storage: StorageKind,
        is_abstract: bool,
    ) -> RepoResult<Arc<ResourceClass>> {
        let subject = format!("class={name} storage={}", storage.as_str());
        self.evolve("schema_define_class", &subject, |evolution, conn| {
            evolution.define_class(conn, name, parents, storage, is_abstract)
        })
    }

    pub fn drop_class(&self, name: &str) -> RepoResult<()> {
        self.evolve("schema_drop_class", &format!("class={name}"), |evolution, conn| {
            evolution.drop_class(conn, name)
        })
    }

    pub fn add_attribute(
        &self,
        class_name: &str,
        spec: AttributeSpec,
        initial: impl Into<RawValue>,
    ) -> RepoResult<Arc<AttributeDefinition>> {
        let subject = format!(
            "class={class_name} attribute={} type={}",
            spec.name, spec.type_name
        );
        let initial = initial.into();
        self.evolve("schema_add_attribute", &subject, |evolution, conn| {
            evolution.add_attribute(conn, class_name, spec, initial)
        })
    }

    pub fn delete_attribute(&self, class_name: &str, attribute_name: &str) -> RepoResult<()> {
        let subject = format!("class={class_name} attribute={attribute_name}");
        self.evolve("schema_delete_attribute", &subject, |evolution, conn| {
            evolution.delete_attribute(conn, class_name, attribute_name)
        })
    }

    pub fn add_parent_class(
        &self,
        class_name: &str,
        parent_name: &str,
        initial: Vec<(String, RawValue)>,
    ) -> RepoResult<()> {
        let subject = format!("class={class_name} parent={parent_name}");
        self.evolve("schema_add_parent_class", &subject, |evolution, conn| {
            evolution.add_parent_class(conn, class_name, parent_name, initial)
        })
    }

    pub fn delete_parent_class(&self, class_name: &str, parent_name: &str) -> RepoResult<()> {
        let subject = format!("class={class_name} parent={parent_name}");
        self.evolve("schema_delete_parent_class", &subject, |evolution, conn| {
            evolution.delete_parent_class(conn, class_name, parent_name)
        })
    }

    /// Reloads the schema from storage and reverts every live instance.
    pub fn resync(&self) -> RepoResult<RevertReport> {
        logged("schema_resync", &format!("class={ROOT_CLASS}"), || {
            let snapshot = self.repository.schema().reload(self.conn)?;
            let root = snapshot.class_by_name(ROOT_CLASS).cloned().ok_or_else(|| {
                RepoError::invariant("root class missing from the schema")
            })?;
            self.repository.revert_class(self.conn, &root)
        })
    }

    fn evolve<T>(
        &self,
        event: &'static str,
        subject: &str,
        body: impl FnOnce(&SchemaEvolution<'_>, &Connection) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let owns_transaction = self.conn.is_autocommit();
        let result = logged(event, subject, || {
            with_transaction(self.conn, |conn| {
                body(&SchemaEvolution::new(self.repository), conn)
            })
        });
        if result.is_err() && owns_transaction {
            if let Err(err) = self.resync() {
                warn!(
                    "event={} module=service status=resync_failed {} error_code={} error={}",
                    event,
                    subject,
                    err.code(),
                    err
                );
            }
        }
        result
    }
}
