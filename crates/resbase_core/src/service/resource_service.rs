//! Resource use-case service.
//!
//! # Responsibility
//! - Run instance lifecycle calls inside a transaction.
//! - Persist reference clearing together with the instance update.

use super::logged;
use crate::db::with_transaction;
use crate::model::ids::ResourceId;
use crate::model::resource::Resource;
use crate::repo::{NewResource, RepoResult, ResourceRepository, RevertReport};
use rusqlite::Connection;
use std::sync::Arc;

pub struct ResourceService<'a> {
    conn: &'a Connection,
    repository: &'a ResourceRepository,
}

impl<'a> ResourceService<'a> {
    pub fn new(conn: &'a Connection, repository: &'a ResourceRepository) -> Self {
        Self { conn, repository }
    }

    pub fn create(&self, new: NewResource) -> RepoResult<Arc<Resource>> {
        let subject = format!("class={}", new.class_name());
        logged("resource_create", &subject, || {
            with_transaction(self.conn, |conn| self.repository.create(conn, new))
        })
    }

    pub fn retrieve(&self, id: ResourceId) -> RepoResult<Arc<Resource>> {
        self.repository.retrieve(self.conn, id)
    }

    pub fn retrieve_many(&self, ids: &[ResourceId]) -> RepoResult<Vec<Arc<Resource>>> {
        self.repository.retrieve_many(self.conn, ids)
    }

    pub fn update(&self, resource: &Resource) -> RepoResult<()> {
        logged("resource_update", &subject_of(resource), || {
            with_transaction(self.conn, |conn| self.repository.update(conn, resource))
        })
    }

    pub fn revert(&self, resource: &Resource) -> RepoResult<()> {
        logged("resource_revert", &subject_of(resource), || {
            self.repository.revert(self.conn, resource)
        })
    }

    pub fn delete(&self, resource: &Resource) -> RepoResult<()> {
        logged("resource_delete", &subject_of(resource), || {
            with_transaction(self.conn, |conn| self.repository.delete(conn, resource))
        })
    }

    /// Reverts every live instance of `class_name` and its subclasses.
    pub fn revert_class(&self, class_name: &str) -> RepoResult<RevertReport> {
        let subject = format!("class={class_name}");
        logged("resource_revert_class", &subject, || {
            let class = self.repository.schema().class_by_name(class_name)?;
            self.repository.revert_class(self.conn, &class)
        })
    }

    pub fn resource_references(&self, resource: &Resource) -> RepoResult<Vec<ResourceId>> {
        self.repository.resource_references(self.conn, resource)
    }

    /// Drops references to `targets` (all when empty) and stores the result.
    pub fn clear_resource_references(
        &self,
        resource: &Resource,
        targets: &[ResourceId],
    ) -> RepoResult<bool> {
        logged("resource_clear_references", &subject_of(resource), || {
            with_transaction(self.conn, |conn| {
                let changed = self
                    .repository
                    .clear_resource_references(conn, resource, targets)?;
                if changed {
                    self.repository.update(conn, resource)?;
                }
                Ok(changed)
            })
        })
    }
}

fn subject_of(resource: &Resource) -> String {
    format!("resource_id={}", resource.id().get())
}
