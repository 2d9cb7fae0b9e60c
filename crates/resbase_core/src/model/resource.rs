//! Live resource instances.
//!
//! # Responsibility
//! - Pair a resource's metadata row with its attribute storage.
//! - Serve reads lazily and track writes until the repository persists them.
//!
//! # Invariants
//! - All state sits behind one per-instance mutex.
//! - `set_value` and `unset` never touch the database; `update` does.
//! - Builtin attributes read and write through the metadata, never through
//!   attribute storage.

use crate::model::flags::AttributeFlags;
use crate::model::ids::{ClassId, ResourceId, SubjectId, ValueId};
use crate::model::schema::{AttributeDefinition, ResourceClass};
use crate::model::storage::AttributeStorage;
use crate::model::value::{date_from_millis, AttributeValue, RawValue};
use crate::repo::{RepoError, RepoResult};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Row of the `resources` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: ResourceId,
    pub class_id: ClassId,
    pub name: String,
    pub owner: Option<SubjectId>,
    pub parent: Option<ResourceId>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub modified_at: i64,
}

impl ResourceMeta {
    /// Metadata for a resource that has not been stored yet.
    pub fn unsaved(class_id: ClassId, name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: ResourceId(0),
            class_id,
            name: name.into(),
            owner: None,
            parent: None,
            created_at: now,
            modified_at: now,
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub(crate) struct ResourceState {
    pub(crate) class: Arc<ResourceClass>,
    pub(crate) meta: ResourceMeta,
    pub(crate) meta_modified: bool,
    pub(crate) storage: AttributeStorage,
    pub(crate) deleted: bool,
}

impl ResourceState {
    /// The instance's own definition of `attribute`.
    pub(crate) fn resolve(&self, attribute: &AttributeDefinition) -> RepoResult<Arc<AttributeDefinition>> {
        self.class
            .attribute_by_id(attribute.id)
            .cloned()
            .ok_or_else(|| RepoError::ClassMismatch {
                expected: attribute.class_id.to_string(),
                actual: self.class.name.clone(),
            })
    }

    /// Reads a stored value into the cache when only its id is known.
    pub(crate) fn ensure_loaded(
        &mut self,
        conn: &Connection,
        attribute: &AttributeDefinition,
    ) -> RepoResult<()> {
        let id = self.storage.value_id(attribute.index);
        if self.storage.value(attribute.index).is_none() && id.is_stored() {
            let value = attribute
                .handler()
                .retrieve(conn, id)
                .map_err(RepoError::internal)?;
            self.storage.set_value(attribute.index, Some(value));
        }
        Ok(())
    }

    pub(crate) fn is_value_modified(&self, attribute: &AttributeDefinition) -> bool {
        if attribute.is_builtin() {
            return self.meta_modified;
        }
        self.storage.is_attribute_modified(attribute)
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.meta_modified
            || self.storage.any_modified()
            || self
                .class
                .attributes
                .iter()
                .filter(|attr| attr.is_concrete())
                .any(|attr| self.is_value_modified(attr))
    }

    /// Clears modification state after a successful write.
    pub(crate) fn mark_persisted(&mut self) {
        self.meta_modified = false;
        self.storage.clear_modified();
        for attribute in self.class.attributes.iter() {
            if let Some(value) = self.storage.value_mut(attribute.index) {
                value.mark_clean();
            }
        }
    }

    fn builtin_value(&self, attribute: &AttributeDefinition) -> Option<AttributeValue> {
        match attribute.name.as_str() {
            "name" => Some(AttributeValue::String(self.meta.name.clone())),
            "owner" => self.meta.owner.map(AttributeValue::Subject),
            "parent" => self.meta.parent.map(AttributeValue::Resource),
            "created" => date_from_millis(self.meta.created_at).map(AttributeValue::Date),
            "modified" => date_from_millis(self.meta.modified_at).map(AttributeValue::Date),
            _ => None,
        }
    }

    fn set_builtin(
        &mut self,
        attribute: &AttributeDefinition,
        value: Option<AttributeValue>,
    ) -> RepoResult<()> {
        if self.builtin_value(attribute) == value {
            return Ok(());
        }
        match (attribute.name.as_str(), value) {
            ("name", Some(AttributeValue::String(name))) if !name.is_empty() => {
                self.meta.name = name;
            }
            ("name", _) => {
                return Err(RepoError::ValueRequired {
                    class: self.class.name.clone(),
                    attribute: attribute.name.clone(),
                })
            }
            ("owner", Some(AttributeValue::Subject(owner))) => self.meta.owner = Some(owner),
            ("owner", None) => self.meta.owner = None,
            ("parent", Some(AttributeValue::Resource(parent))) => {
                if parent == self.meta.id {
                    return Err(RepoError::invalid("a resource cannot be its own parent"));
                }
                self.meta.parent = Some(parent);
            }
            ("parent", None) => self.meta.parent = None,
            (name, Some(other)) => {
                return Err(RepoError::invalid(format!(
                    "builtin attribute `{name}` cannot hold a {} value",
                    other.kind_name()
                )))
            }
            (name, None) => {
                return Err(RepoError::invalid(format!(
                    "builtin attribute `{name}` cannot be unset"
                )))
            }
        }
        self.meta_modified = true;
        Ok(())
    }
}

/// A live object conforming to a resource class.
#[derive(Debug)]
pub struct Resource {
    id: ResourceId,
    state: Mutex<ResourceState>,
}

impl Resource {
    pub(crate) fn new(meta: ResourceMeta, class: Arc<ResourceClass>, storage: AttributeStorage) -> Self {
        Self {
            id: meta.id,
            state: Mutex::new(ResourceState {
                class,
                meta,
                meta_modified: false,
                storage,
                deleted: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock()
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn class(&self) -> Arc<ResourceClass> {
        self.state.lock().class.clone()
    }

    pub fn meta(&self) -> ResourceMeta {
        self.state.lock().meta.clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().meta.name.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Any attribute or metadata change not yet persisted.
    pub fn is_modified(&self) -> bool {
        self.state.lock().is_modified()
    }

    /// Looks `name` up in the instance's current class closure.
    pub fn attribute(&self, name: &str) -> RepoResult<Arc<AttributeDefinition>> {
        let state = self.state.lock();
        state.class.attribute(name).cloned().ok_or_else(|| {
            RepoError::invalid(format!(
                "class `{}` has no attribute `{name}`",
                state.class.name
            ))
        })
    }

    pub fn get(&self, conn: &Connection, name: &str) -> RepoResult<Option<AttributeValue>> {
        let attribute = self.attribute(name)?;
        self.get_value(conn, &attribute)
    }

    /// Current value, loaded on first access when only its id is cached.
    pub fn get_value(
        &self,
        conn: &Connection,
        attribute: &AttributeDefinition,
    ) -> RepoResult<Option<AttributeValue>> {
        let mut state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        if attribute.is_builtin() {
            return Ok(state.builtin_value(&attribute));
        }
        state.ensure_loaded(conn, &attribute)?;
        Ok(state.storage.value(attribute.index).cloned())
    }

    pub fn set(&self, conn: &Connection, name: &str, value: impl Into<RawValue>) -> RepoResult<()> {
        let attribute = self.attribute(name)?;
        self.set_value(conn, &attribute, value)
    }

    /// Converts and caches a new value; a write equal to the current value
    /// leaves the attribute unmodified.
    pub fn set_value(
        &self,
        conn: &Connection,
        attribute: &AttributeDefinition,
        value: impl Into<RawValue>,
    ) -> RepoResult<()> {
        let mut state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        check_writable(&attribute)?;
        let value = attribute
            .handler()
            .to_attribute_value(conn, value.into())
            .map_err(|err| RepoError::attribute(&attribute.name, err))?;
        if attribute.is_builtin() {
            return state.set_builtin(&attribute, value);
        }

        state.ensure_loaded(conn, &attribute)?;
        if state.storage.value(attribute.index) == value.as_ref() {
            return Ok(());
        }
        state.storage.set_value(attribute.index, value);
        state.storage.set_modified(attribute.index, true);
        Ok(())
    }

    pub fn unset(&self, name: &str) -> RepoResult<()> {
        let attribute = self.attribute(name)?;
        self.unset_value(&attribute)
    }

    /// Clears the value; always marks the attribute modified.
    pub fn unset_value(&self, attribute: &AttributeDefinition) -> RepoResult<()> {
        let mut state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        check_writable(&attribute)?;
        if attribute.is_builtin() {
            return state.set_builtin(&attribute, None);
        }
        state.storage.set_value(attribute.index, None);
        state.storage.set_modified(attribute.index, true);
        Ok(())
    }

    /// Mutates the cached value in place. Returns `None` when unset.
    pub fn modify_value<R>(
        &self,
        conn: &Connection,
        attribute: &AttributeDefinition,
        mutate: impl FnOnce(&mut AttributeValue) -> R,
    ) -> RepoResult<Option<R>> {
        let mut state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        check_writable(&attribute)?;
        if attribute.is_builtin() {
            return Err(RepoError::unsupported(format!(
                "builtin attribute `{}` cannot be modified in place",
                attribute.name
            )));
        }
        state.ensure_loaded(conn, &attribute)?;
        let Some(value) = state.storage.value_mut(attribute.index) else {
            return Ok(None);
        };
        // Not every composite tracks its own mutations, so compare as well.
        let before = value.clone();
        let result = mutate(value);
        if before != *value {
            state.storage.set_modified(attribute.index, true);
        }
        Ok(Some(result))
    }

    pub fn is_value_modified(&self, attribute: &AttributeDefinition) -> RepoResult<bool> {
        let state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        Ok(state.is_value_modified(&attribute))
    }

    pub fn value_id(&self, attribute: &AttributeDefinition) -> RepoResult<ValueId> {
        let state = self.state.lock();
        let attribute = state.resolve(attribute)?;
        if attribute.is_builtin() {
            return Ok(ValueId::INLINE);
        }
        Ok(state.storage.value_id(attribute.index))
    }
}

fn check_writable(attribute: &AttributeDefinition) -> RepoResult<()> {
    if attribute.flags.contains(AttributeFlags::READONLY) {
        return Err(RepoError::unsupported(format!(
            "attribute `{}` is read-only",
            attribute.name
        )));
    }
    if attribute.flags.contains(AttributeFlags::SYNTHETIC) {
        return Err(RepoError::unsupported(format!(
            "attribute `{}` is computed",
            attribute.name
        )));
    }
    Ok(())
}
