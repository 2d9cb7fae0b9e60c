//! Resource repository: instance lifecycle across the handler chain.
//!
//! # Responsibility
//! - Validate, create, load, persist, revert and delete resource instances.
//! - Keep the live instance cache in step with every lifecycle call.
//!
//! # Invariants
//! - Every call runs on the caller's connection/transaction; nothing here
//!   commits.
//! - After `create`, `update` or `revert` no attribute reports modified.
//! - A failed `update` leaves the instance's in-memory state as it was.

use crate::handler::AttributeHandlerRegistry;
use crate::model::catalog::Schema;
use crate::model::flags::AttributeFlags;
use crate::model::ids::{ResourceId, SubjectId};
use crate::model::resource::{now_millis, Resource, ResourceMeta};
use crate::model::schema::{partition, AttributeDefinition, ResourceClass, StorageKind};
use crate::model::storage::AttributeStorage;
use crate::model::value::{AttributeValue, RawValue};
use crate::repo::cache::InstanceCache;
use crate::repo::context::LoadContext;
use crate::repo::resource_handler::ResourceHandlers;
use crate::repo::{RepoError, RepoResult};
use log::info;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Input for `ResourceRepository::create`.
#[derive(Debug, Clone)]
pub struct NewResource {
    class: String,
    name: String,
    owner: Option<SubjectId>,
    parent: Option<ResourceId>,
    values: Vec<(String, RawValue)>,
}

impl NewResource {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            owner: None,
            parent: None,
            values: Vec::new(),
        }
    }

    pub fn owner(mut self, owner: SubjectId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn parent(mut self, parent: ResourceId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Supplies an attribute value; later values for the same name win.
    pub fn value(mut self, attribute: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.values.push((attribute.into(), value.into()));
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }
}

/// Outcome of a class-level revert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevertReport {
    /// Live instances reloaded from storage.
    pub reverted: usize,
    /// Live instances whose rows were gone; marked deleted and uncached.
    pub evicted: usize,
    /// Queries issued for the shared data load.
    pub reads: usize,
}

pub struct ResourceRepository {
    schema: Schema,
    handlers: ResourceHandlers,
    cache: InstanceCache,
}

impl ResourceRepository {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            handlers: ResourceHandlers::new(),
            cache: InstanceCache::new(),
        }
    }

    /// Loads the schema and, when `preload` is set, fills handler caches.
    pub fn open(
        conn: &Connection,
        registry: &AttributeHandlerRegistry,
        preload: bool,
    ) -> RepoResult<Self> {
        let schema = Schema::load(conn, registry)?;
        if preload {
            schema.activate(conn)?;
        }
        Ok(Self::new(schema))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn handlers(&self) -> &ResourceHandlers {
        &self.handlers
    }

    pub fn create(&self, conn: &Connection, new: NewResource) -> RepoResult<Arc<Resource>> {
        let class = self.schema.class_by_name(&new.class)?;
        if class.is_abstract {
            return Err(RepoError::invalid(format!(
                "class `{}` is abstract and has no direct instances",
                class.name
            )));
        }

        let mut meta = ResourceMeta::unsaved(class.id, new.name);
        meta.owner = new.owner;
        meta.parent = new.parent;
        let mut storage = AttributeStorage::with_slots(class.slot_count());
        for (name, raw) in new.values {
            let attribute = class.attribute(&name).cloned().ok_or_else(|| {
                RepoError::invalid(format!("class `{}` has no attribute `{name}`", class.name))
            })?;
            if attribute.flags.contains(AttributeFlags::SYNTHETIC) {
                return Err(RepoError::unsupported(format!(
                    "attribute `{name}` is computed"
                )));
            }
            let value = attribute
                .handler()
                .to_attribute_value(conn, raw)
                .map_err(|err| RepoError::attribute(&attribute.name, err))?;
            if attribute.is_builtin() {
                assign_builtin(&mut meta, &attribute, value)?;
            } else {
                storage.set_value(attribute.index, value);
            }
        }

        check_required(&class, &meta, &storage, |_| true)?;
        check_domains(conn, &class, &storage, |_| true)?;

        for group in partition(&class) {
            self.handlers
                .for_kind(group.storage)
                .create(conn, &mut meta, &group.classes, &mut storage)?;
        }

        storage.clear_modified();
        let resource = Arc::new(Resource::new(meta, class, storage));
        resource.lock().mark_persisted();
        Ok(self.cache.register(resource))
    }

    /// Returns the live instance for `id`, loading it when not cached.
    pub fn retrieve(&self, conn: &Connection, id: ResourceId) -> RepoResult<Arc<Resource>> {
        if let Some(found) = self.cache.find(id) {
            return Ok(found);
        }
        let mut ctx = LoadContext::new(vec![id]);
        let resource = self.load(conn, id, &mut ctx)?;
        Ok(self.cache.register(Arc::new(resource)))
    }

    /// Loads several instances with one shared data load, in input order.
    pub fn retrieve_many(
        &self,
        conn: &Connection,
        ids: &[ResourceId],
    ) -> RepoResult<Vec<Arc<Resource>>> {
        let mut cached = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.cache.find(*id) {
                Some(found) => {
                    cached.insert(*id, found);
                }
                None => missing.push(*id),
            }
        }
        let mut ctx = LoadContext::new(missing);
        let mut resources = Vec::with_capacity(ids.len());
        for id in ids {
            let resource = match cached.get(id) {
                Some(found) => found.clone(),
                None => {
                    let loaded = self.cache.register(Arc::new(self.load(conn, *id, &mut ctx)?));
                    cached.insert(*id, loaded.clone());
                    loaded
                }
            };
            resources.push(resource);
        }
        Ok(resources)
    }

    /// Live cached instance, without touching storage.
    pub fn find(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.cache.find(id)
    }

    /// Ids of stored instances of `class` and its descendants.
    pub fn instances_of(
        &self,
        conn: &Connection,
        class: &ResourceClass,
    ) -> RepoResult<Vec<ResourceId>> {
        let family = class.family_ids();
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM resources WHERE class_id IN ({}) ORDER BY id;",
            vec!["?"; family.len()].join(", ")
        ))?;
        let ids = stmt
            .query_map(params_from_iter(family.iter().map(|id| id.get())), |row| {
                row.get::<_, i64>(0)
            })?
            .map(|id| id.map(ResourceId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Persists modified attributes and metadata.
    pub fn update(&self, conn: &Connection, resource: &Resource) -> RepoResult<()> {
        let mut guard = resource.lock();
        let state = &mut *guard;
        if state.deleted {
            return Err(deleted(resource.id()));
        }
        if !state.is_modified() {
            return Ok(());
        }

        let class = state.class.clone();
        let modified = |attribute: &AttributeDefinition| state.storage.is_attribute_modified(attribute);
        check_required(&class, &state.meta, &state.storage, modified)?;
        check_domains(conn, &class, &state.storage, modified)?;

        let backup = state.storage.clone();
        let previous_modified_at = state.meta.modified_at;
        state.meta.modified_at = now_millis();
        for group in partition(&class) {
            let written = self.handlers.for_kind(group.storage).update(
                conn,
                &state.meta,
                &group.classes,
                &mut state.storage,
            );
            if let Err(err) = written {
                state.storage = backup;
                state.meta.modified_at = previous_modified_at;
                return Err(err);
            }
        }
        state.mark_persisted();
        Ok(())
    }

    /// Reloads one instance from storage, discarding unsaved changes.
    pub fn revert(&self, conn: &Connection, resource: &Resource) -> RepoResult<()> {
        let mut ctx = LoadContext::new(vec![resource.id()]);
        if self.refresh(conn, resource, &mut ctx)? {
            Ok(())
        } else {
            Err(deleted(resource.id()))
        }
    }

    /// Reverts every live instance of `class` and its descendants with one
    /// shared data load.
    pub fn revert_class(&self, conn: &Connection, class: &ResourceClass) -> RepoResult<RevertReport> {
        let started_at = Instant::now();
        let instances = self.cache.live_instances(class);
        let mut ctx = LoadContext::new(instances.iter().map(|resource| resource.id()).collect());
        let mut report = RevertReport::default();
        for resource in &instances {
            if self.refresh(conn, resource, &mut ctx)? {
                report.reverted += 1;
            } else {
                report.evicted += 1;
            }
        }
        report.reads = ctx.reads();
        info!(
            "event=revert_class module=repo status=ok class={} reverted={} evicted={} reads={} duration_ms={}",
            class.name,
            report.reverted,
            report.evicted,
            report.reads,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    pub fn delete(&self, conn: &Connection, resource: &Resource) -> RepoResult<()> {
        let mut state = resource.lock();
        if state.deleted {
            return Err(deleted(resource.id()));
        }
        let class = state.class.clone();
        for group in partition(&class).iter().rev() {
            self.handlers.for_kind(group.storage).delete(
                conn,
                resource.id(),
                &group.classes,
                &state.storage,
            )?;
        }
        state.deleted = true;
        drop(state);
        self.cache.remove(resource.id());
        Ok(())
    }

    /// Resources referenced from concrete attributes of `resource`.
    pub fn resource_references(
        &self,
        conn: &Connection,
        resource: &Resource,
    ) -> RepoResult<Vec<ResourceId>> {
        let mut state = resource.lock();
        let class = state.class.clone();
        let mut references = Vec::new();
        for attribute in reference_attributes(&class) {
            state.ensure_loaded(conn, attribute)?;
            if let Some(value) = state.storage.value(attribute.index) {
                references.extend(attribute.handler().resource_references(value));
            }
        }
        Ok(references)
    }

    /// Drops references to `targets` (all references when empty) from the
    /// cached values. Changes are persisted by the next `update`.
    pub fn clear_resource_references(
        &self,
        conn: &Connection,
        resource: &Resource,
        targets: &[ResourceId],
    ) -> RepoResult<bool> {
        let mut guard = resource.lock();
        let state = &mut *guard;
        let class = state.class.clone();
        let mut changed = false;
        for attribute in reference_attributes(&class) {
            state.ensure_loaded(conn, attribute)?;
            let handler = attribute.handler();
            let Some(value) = state.storage.value_mut(attribute.index) else {
                continue;
            };
            let cleared = if handler.is_composite() {
                handler.clear_resource_references(value, targets)
            } else {
                let references = handler.resource_references(value);
                let hit = targets.is_empty()
                    || references.iter().any(|reference| targets.contains(reference));
                if hit {
                    state.storage.set_value(attribute.index, None);
                }
                hit
            };
            if cleared {
                state.storage.set_modified(attribute.index, true);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn load(&self, conn: &Connection, id: ResourceId, ctx: &mut LoadContext) -> RepoResult<Resource> {
        self.handlers
            .for_kind(StorageKind::Builtin)
            .get_data(conn, &[], ctx)?;
        let meta = ctx.meta(id).cloned().ok_or(RepoError::EntityNotFound {
            entity: "resources",
            id: id.get(),
        })?;
        let class = self.class_of(&meta)?;
        let storage = self.read_storage(conn, &class, id, ctx)?;
        Ok(Resource::new(meta, class, storage))
    }

    /// Reloads `resource` from `ctx`. Returns `false` when its row is gone,
    /// after marking it deleted and dropping it from the cache.
    fn refresh(&self, conn: &Connection, resource: &Resource, ctx: &mut LoadContext) -> RepoResult<bool> {
        self.handlers
            .for_kind(StorageKind::Builtin)
            .get_data(conn, &[], ctx)?;
        let Some(meta) = ctx.meta(resource.id()).cloned() else {
            resource.lock().deleted = true;
            self.cache.remove(resource.id());
            return Ok(false);
        };
        let class = self.class_of(&meta)?;
        let storage = self.read_storage(conn, &class, resource.id(), ctx)?;

        let mut state = resource.lock();
        state.class = class;
        state.meta = meta;
        state.meta_modified = false;
        state.storage = storage;
        state.deleted = false;
        Ok(true)
    }

    fn class_of(&self, meta: &ResourceMeta) -> RepoResult<Arc<ResourceClass>> {
        self.schema.class(meta.class_id).ok_or_else(|| {
            RepoError::invariant(format!(
                "{} refers to unknown {}",
                meta.id, meta.class_id
            ))
        })
    }

    fn read_storage(
        &self,
        conn: &Connection,
        class: &Arc<ResourceClass>,
        id: ResourceId,
        ctx: &mut LoadContext,
    ) -> RepoResult<AttributeStorage> {
        let mut storage = AttributeStorage::with_slots(class.slot_count());
        for group in partition(class) {
            let handler = self.handlers.for_kind(group.storage);
            handler.get_data(conn, &group.classes, ctx)?;
            handler.apply(ctx, &group.classes, id, &mut storage)?;
        }
        Ok(storage)
    }
}

fn deleted(id: ResourceId) -> RepoError {
    RepoError::EntityNotFound {
        entity: "resources",
        id: id.get(),
    }
}

fn reference_attributes(class: &ResourceClass) -> impl Iterator<Item = &Arc<AttributeDefinition>> {
    class
        .attributes
        .iter()
        .filter(|attr| attr.is_concrete() && attr.handler().contains_resource_references())
}

/// Writes a builtin attribute supplied at creation into the metadata.
fn assign_builtin(
    meta: &mut ResourceMeta,
    attribute: &AttributeDefinition,
    value: Option<AttributeValue>,
) -> RepoResult<()> {
    match (attribute.name.as_str(), value) {
        ("name", Some(AttributeValue::String(name))) => meta.name = name,
        ("name", None) => meta.name.clear(),
        ("owner", Some(AttributeValue::Subject(owner))) => meta.owner = Some(owner),
        ("owner", None) => meta.owner = None,
        ("parent", Some(AttributeValue::Resource(parent))) => meta.parent = Some(parent),
        ("parent", None) => meta.parent = None,
        ("created", Some(AttributeValue::Date(date))) => meta.created_at = date.timestamp_millis(),
        ("modified", Some(AttributeValue::Date(date))) => meta.modified_at = date.timestamp_millis(),
        (name, _) => {
            return Err(RepoError::invalid(format!(
                "unsupported value for builtin attribute `{name}`"
            )))
        }
    }
    Ok(())
}

/// REQUIRED attributes selected by `scope` must hold a value.
fn check_required(
    class: &ResourceClass,
    meta: &ResourceMeta,
    storage: &AttributeStorage,
    scope: impl Fn(&AttributeDefinition) -> bool,
) -> RepoResult<()> {
    for attribute in class.attributes.iter().filter(|attr| attr.is_required()) {
        let present = if attribute.is_builtin() {
            attribute.name != "name" || !meta.name.is_empty()
        } else if attribute.flags.contains(AttributeFlags::SYNTHETIC) || !scope(attribute) {
            true
        } else {
            storage.value(attribute.index).is_some()
        };
        if !present {
            return Err(RepoError::ValueRequired {
                class: class.name.clone(),
                attribute: attribute.name.clone(),
            });
        }
    }
    Ok(())
}

/// Values of attributes selected by `scope` must satisfy their domain.
fn check_domains(
    conn: &Connection,
    class: &ResourceClass,
    storage: &AttributeStorage,
    scope: impl Fn(&AttributeDefinition) -> bool,
) -> RepoResult<()> {
    for attribute in class.attributes.iter().filter(|attr| attr.is_concrete()) {
        let Some(domain) = attribute.domain.as_deref() else {
            continue;
        };
        if !scope(attribute) {
            continue;
        }
        if let Some(value) = storage.value(attribute.index) {
            attribute
                .handler()
                .check_domain(conn, domain, Some(value))
                .map_err(|err| RepoError::attribute(&attribute.name, err))?;
        }
    }
    Ok(())
}
