//! Shared data accumulator for loading several instances at once.
//!
//! Resource handlers fill a `LoadContext` once per class table (or once for
//! the metadata and dynamic tables) and then apply it per instance, so the
//! number of reads does not grow with the number of instances.

use crate::model::ids::{AttributeId, ClassId, ResourceId, ValueId};
use crate::model::resource::ResourceMeta;
use rusqlite::types::Value as SqlValue;
use std::collections::{HashMap, HashSet};

/// Row of one class table, keyed by column name.
pub type ClassRow = HashMap<String, SqlValue>;

#[derive(Debug, Default)]
pub struct LoadContext {
    ids: Vec<ResourceId>,
    meta: Option<HashMap<ResourceId, ResourceMeta>>,
    rows: HashMap<ClassId, HashMap<ResourceId, ClassRow>>,
    dynamic: Option<HashMap<ResourceId, HashMap<AttributeId, ValueId>>>,
    reads: usize,
}

impl LoadContext {
    pub fn new(ids: Vec<ResourceId>) -> Self {
        let mut seen = HashSet::new();
        let ids = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Self {
            ids,
            ..Self::default()
        }
    }

    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    /// Queries issued while filling this context.
    pub fn reads(&self) -> usize {
        self.reads
    }

    pub(crate) fn record_read(&mut self) {
        self.reads += 1;
    }

    pub fn has_meta(&self) -> bool {
        self.meta.is_some()
    }

    pub fn meta(&self, id: ResourceId) -> Option<&ResourceMeta> {
        self.meta.as_ref().and_then(|meta| meta.get(&id))
    }

    pub(crate) fn set_meta(&mut self, meta: HashMap<ResourceId, ResourceMeta>) {
        self.meta = Some(meta);
    }

    pub fn has_rows(&self, class: ClassId) -> bool {
        self.rows.contains_key(&class)
    }

    pub fn row(&self, class: ClassId, id: ResourceId) -> Option<&ClassRow> {
        self.rows.get(&class).and_then(|rows| rows.get(&id))
    }

    pub(crate) fn set_rows(&mut self, class: ClassId, rows: HashMap<ResourceId, ClassRow>) {
        self.rows.insert(class, rows);
    }

    pub fn has_dynamic(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn dynamic_value_id(&self, id: ResourceId, attribute: AttributeId) -> ValueId {
        self.dynamic
            .as_ref()
            .and_then(|links| links.get(&id))
            .and_then(|links| links.get(&attribute))
            .copied()
            .unwrap_or(ValueId::UNSET)
    }

    pub(crate) fn set_dynamic(&mut self, links: HashMap<ResourceId, HashMap<AttributeId, ValueId>>) {
        self.dynamic = Some(links);
    }
}
