//! Resource class DAG and attribute definitions.
//!
//! # Responsibility
//! - Describe resource classes, attribute definitions and attribute types.
//! - Build immutable schema snapshots with a topologically ordered closure
//!   per class.
//!
//! # Invariants
//! - Ancestor lists are in topological order, roots first.
//! - A class's `attributes` is its full closure (inherited + declared), in
//!   ancestor order, and `max_attribute_index` is the largest index in it.
//! - Snapshots are never mutated; schema changes swap in a new snapshot.

use crate::handler::{AttributeError, AttributeHandler};
use crate::model::flags::AttributeFlags;
use crate::model::ids::{AttributeId, ClassId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Attribute type: a name bound to one handler instance.
pub struct AttributeClass {
    name: String,
    handler: Arc<dyn AttributeHandler>,
}

impl AttributeClass {
    pub fn new(name: impl Into<String>, handler: Arc<dyn AttributeHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &dyn AttributeHandler {
        self.handler.as_ref()
    }

    /// Values live in a handler-managed side table rather than a column.
    pub fn uses_custom_storage(&self) -> bool {
        !self.handler.supports_external_string()
    }
}

impl std::fmt::Debug for AttributeClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeClass")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named, typed field declared on one resource class.
#[derive(Debug, Clone)]
pub struct AttributeDefinition {
    pub id: AttributeId,
    /// Declaring class.
    pub class_id: ClassId,
    pub name: String,
    pub attribute_class: Arc<AttributeClass>,
    /// Slot in instance attribute storage.
    pub index: usize,
    pub flags: AttributeFlags,
    pub domain: Option<String>,
    pub column_name: Option<String>,
}

impl AttributeDefinition {
    /// Storage column: the override when set, the attribute name otherwise.
    pub fn column(&self) -> &str {
        self.column_name.as_deref().unwrap_or(&self.name)
    }

    pub fn handler(&self) -> &dyn AttributeHandler {
        self.attribute_class.handler()
    }

    pub fn type_name(&self) -> &str {
        self.attribute_class.name()
    }

    pub fn is_concrete(&self) -> bool {
        self.flags.is_concrete()
    }

    pub fn is_builtin(&self) -> bool {
        self.flags.contains(AttributeFlags::BUILTIN)
    }

    pub fn is_required(&self) -> bool {
        self.flags.contains(AttributeFlags::REQUIRED)
    }

    /// Stored inline in the class table column.
    pub fn is_inline(&self) -> bool {
        self.handler().supports_external_string()
    }
}

/// Storage strategy of a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKind {
    /// Root class; attributes live in the `resources` metadata row.
    Builtin,
    /// One table per class, one column per concrete attribute.
    Table,
    /// Rows in the generic `resource_attributes` table.
    Dynamic,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Table => "table",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "builtin" => Some(Self::Builtin),
            "table" => Some(Self::Table),
            "dynamic" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// Schema node.
#[derive(Debug)]
pub struct ResourceClass {
    pub id: ClassId,
    pub name: String,
    /// Per-class table name (Table strategy); the table may not exist yet.
    pub table_name: Option<String>,
    pub storage: StorageKind,
    pub is_abstract: bool,
    /// Direct parents in declaration order.
    pub parents: Vec<ClassId>,
    pub children: Vec<ClassId>,
    /// Transitive parents, topologically ordered, roots first.
    pub ancestors: Vec<Arc<ResourceClass>>,
    /// Transitive children, topologically ordered.
    pub descendants: Vec<ClassId>,
    pub declared: Vec<Arc<AttributeDefinition>>,
    /// Full closure: ancestors' attributes then the declared ones.
    pub attributes: Vec<Arc<AttributeDefinition>>,
    pub max_attribute_index: i64,
}

impl ResourceClass {
    /// Storage slots an instance of this class needs.
    pub fn slot_count(&self) -> usize {
        usize::try_from(self.max_attribute_index + 1).unwrap_or(0)
    }

    pub fn attribute(&self, name: &str) -> Option<&Arc<AttributeDefinition>> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn attribute_by_id(&self, id: AttributeId) -> Option<&Arc<AttributeDefinition>> {
        self.attributes.iter().find(|attr| attr.id == id)
    }

    pub fn declared_attribute(&self, name: &str) -> Option<&Arc<AttributeDefinition>> {
        self.declared.iter().find(|attr| attr.name == name)
    }

    /// Declared attributes with physical storage.
    pub fn concrete_declared(&self) -> impl Iterator<Item = &Arc<AttributeDefinition>> {
        self.declared.iter().filter(|attr| attr.is_concrete())
    }

    pub fn has_concrete_attributes(&self) -> bool {
        self.concrete_declared().next().is_some()
    }

    /// `self` is `class` or derives from it.
    pub fn is_a(&self, class: ClassId) -> bool {
        self.id == class || self.ancestors.iter().any(|ancestor| ancestor.id == class)
    }

    /// Ancestor ids followed by the class's own id.
    pub fn lineage_ids(&self) -> Vec<ClassId> {
        self.ancestors
            .iter()
            .map(|ancestor| ancestor.id)
            .chain(std::iter::once(self.id))
            .collect()
    }

    /// The class and its descendants.
    pub fn family_ids(&self) -> Vec<ClassId> {
        std::iter::once(self.id)
            .chain(self.descendants.iter().copied())
            .collect()
    }
}

/// Ancestors plus the class itself, grouped by storage strategy.
///
/// Groups keep first-appearance order, so the root (`Builtin`) group comes
/// first, and classes inside a group stay topologically ordered.
#[derive(Debug, Clone)]
pub struct Partition {
    pub storage: StorageKind,
    pub classes: Vec<Arc<ResourceClass>>,
}

pub fn partition(class: &Arc<ResourceClass>) -> Vec<Partition> {
    let mut groups: Vec<Partition> = Vec::new();
    for member in class.ancestors.iter().chain(std::iter::once(class)) {
        match groups.iter_mut().find(|group| group.storage == member.storage) {
            Some(group) => group.classes.push(member.clone()),
            None => groups.push(Partition {
                storage: member.storage,
                classes: vec![member.clone()],
            }),
        }
    }
    groups
}

#[derive(Debug)]
pub enum SchemaError {
    Db(crate::db::DbError),
    UnknownClass(String),
    UnknownAttribute { class: String, attribute: String },
    UnknownAttributeType(String),
    DuplicateName(String),
    /// Parent edges would form a cycle.
    Cycle(String),
    InvalidDefinition(String),
    Attribute(AttributeError),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UnknownClass(name) => write!(f, "unknown resource class `{name}`"),
            Self::UnknownAttribute { class, attribute } => {
                write!(f, "class `{class}` has no attribute `{attribute}`")
            }
            Self::UnknownAttributeType(name) => write!(f, "unknown attribute type `{name}`"),
            Self::DuplicateName(message) => write!(f, "duplicate name: {message}"),
            Self::Cycle(message) => write!(f, "class hierarchy cycle: {message}"),
            Self::InvalidDefinition(message) => write!(f, "invalid schema definition: {message}"),
            Self::Attribute(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SchemaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Attribute(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AttributeError> for SchemaError {
    fn from(value: AttributeError) -> Self {
        match value {
            AttributeError::Db(err) => Self::Db(err),
            other => Self::Attribute(other),
        }
    }
}

impl From<crate::db::DbError> for SchemaError {
    fn from(value: crate::db::DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SchemaError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(crate::db::DbError::Sqlite(value))
    }
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Catalog row of one class.
#[derive(Debug, Clone)]
pub struct ClassRecord {
    pub id: ClassId,
    pub name: String,
    pub table_name: Option<String>,
    pub storage: StorageKind,
    pub is_abstract: bool,
}

/// Catalog row of one attribute definition.
#[derive(Debug, Clone)]
pub struct AttributeRecord {
    pub id: AttributeId,
    pub class_id: ClassId,
    pub name: String,
    pub type_name: String,
    pub index: usize,
    pub flags: AttributeFlags,
    pub domain: Option<String>,
    pub column_name: Option<String>,
}

/// Immutable view of the whole schema.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    classes: HashMap<ClassId, Arc<ResourceClass>>,
    by_name: HashMap<String, ClassId>,
    attributes: HashMap<AttributeId, Arc<AttributeDefinition>>,
    /// All classes, roots first.
    order: Vec<ClassId>,
}

impl SchemaSnapshot {
    /// Builds closures from catalog rows. `edges` are `(child, parent)` pairs
    /// in declaration order.
    pub fn build(
        classes: Vec<ClassRecord>,
        edges: Vec<(ClassId, ClassId)>,
        attributes: Vec<AttributeRecord>,
        types: &BTreeMap<String, Arc<AttributeClass>>,
    ) -> SchemaResult<Self> {
        let records: BTreeMap<ClassId, ClassRecord> =
            classes.into_iter().map(|record| (record.id, record)).collect();

        let mut parents: BTreeMap<ClassId, Vec<ClassId>> = BTreeMap::new();
        let mut children: BTreeMap<ClassId, Vec<ClassId>> = BTreeMap::new();
        for (child, parent) in edges {
            if !records.contains_key(&child) || !records.contains_key(&parent) {
                return Err(SchemaError::InvalidDefinition(format!(
                    "parent edge {child} -> {parent} names an unknown class"
                )));
            }
            parents.entry(child).or_default().push(parent);
            children.entry(parent).or_default().push(child);
        }

        let order = topological_order(&records, &parents, &children)?;
        let position: HashMap<ClassId, usize> =
            order.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();

        let mut declared: BTreeMap<ClassId, Vec<Arc<AttributeDefinition>>> = BTreeMap::new();
        let mut by_id = HashMap::new();
        for record in attributes {
            let attribute_class = types
                .get(&record.type_name)
                .cloned()
                .ok_or_else(|| SchemaError::UnknownAttributeType(record.type_name.clone()))?;
            if !records.contains_key(&record.class_id) {
                return Err(SchemaError::InvalidDefinition(format!(
                    "attribute `{}` belongs to unknown {}",
                    record.name, record.class_id
                )));
            }
            let definition = Arc::new(AttributeDefinition {
                id: record.id,
                class_id: record.class_id,
                name: record.name,
                attribute_class,
                index: record.index,
                flags: record.flags,
                domain: record.domain,
                column_name: record.column_name,
            });
            by_id.insert(definition.id, definition.clone());
            declared.entry(definition.class_id).or_default().push(definition);
        }
        for list in declared.values_mut() {
            list.sort_by_key(|attr| attr.index);
        }

        let mut ancestor_sets: HashMap<ClassId, BTreeSet<ClassId>> = HashMap::new();
        for id in &order {
            let mut set = BTreeSet::new();
            for parent in parents.get(id).into_iter().flatten() {
                set.insert(*parent);
                if let Some(inherited) = ancestor_sets.get(parent) {
                    set.extend(inherited.iter().copied());
                }
            }
            ancestor_sets.insert(*id, set);
        }
        let mut descendant_sets: HashMap<ClassId, BTreeSet<ClassId>> = HashMap::new();
        for id in order.iter().rev() {
            let mut set = BTreeSet::new();
            for child in children.get(id).into_iter().flatten() {
                set.insert(*child);
                if let Some(inherited) = descendant_sets.get(child) {
                    set.extend(inherited.iter().copied());
                }
            }
            descendant_sets.insert(*id, set);
        }
        let sorted = |set: &BTreeSet<ClassId>| {
            let mut ids: Vec<ClassId> = set.iter().copied().collect();
            ids.sort_by_key(|id| position[id]);
            ids
        };

        let mut built: HashMap<ClassId, Arc<ResourceClass>> = HashMap::new();
        let mut by_name = HashMap::new();
        for id in &order {
            let record = &records[id];
            let ancestors: Vec<Arc<ResourceClass>> = sorted(&ancestor_sets[id])
                .into_iter()
                .map(|ancestor| built[&ancestor].clone())
                .collect();
            let own = declared.remove(id).unwrap_or_default();
            let attributes: Vec<Arc<AttributeDefinition>> = ancestors
                .iter()
                .flat_map(|ancestor| ancestor.declared.iter().cloned())
                .chain(own.iter().cloned())
                .collect();
            let max_attribute_index = attributes
                .iter()
                .map(|attr| attr.index as i64)
                .max()
                .unwrap_or(-1);
            let class = Arc::new(ResourceClass {
                id: *id,
                name: record.name.clone(),
                table_name: record.table_name.clone(),
                storage: record.storage,
                is_abstract: record.is_abstract,
                parents: parents.get(id).cloned().unwrap_or_default(),
                children: children.get(id).cloned().unwrap_or_default(),
                ancestors,
                descendants: sorted(&descendant_sets[id]),
                declared: own,
                attributes,
                max_attribute_index,
            });
            by_name.insert(class.name.clone(), *id);
            built.insert(*id, class);
        }

        Ok(Self {
            classes: built,
            by_name,
            attributes: by_id,
            order,
        })
    }

    pub fn class(&self, id: ClassId) -> Option<&Arc<ResourceClass>> {
        self.classes.get(&id)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&Arc<ResourceClass>> {
        self.by_name.get(name).and_then(|id| self.classes.get(id))
    }

    pub fn attribute(&self, id: AttributeId) -> Option<&Arc<AttributeDefinition>> {
        self.attributes.get(&id)
    }

    /// Classes in topological order, roots first.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ResourceClass>> {
        self.order.iter().filter_map(|id| self.classes.get(id))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Kahn's algorithm; ties broken by id so the order is deterministic.
fn topological_order(
    records: &BTreeMap<ClassId, ClassRecord>,
    parents: &BTreeMap<ClassId, Vec<ClassId>>,
    children: &BTreeMap<ClassId, Vec<ClassId>>,
) -> SchemaResult<Vec<ClassId>> {
    let mut pending: BTreeMap<ClassId, usize> = records
        .keys()
        .map(|id| (*id, parents.get(id).map_or(0, Vec::len)))
        .collect();
    let mut ready: VecDeque<ClassId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(records.len());

    while let Some(id) = ready.pop_front() {
        order.push(id);
        let mut unlocked = Vec::new();
        for child in children.get(&id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    unlocked.push(*child);
                }
            }
        }
        unlocked.sort();
        ready.extend(unlocked);
    }

    if order.len() != records.len() {
        let stuck: Vec<&str> = pending
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| records[id].name.as_str())
            .collect();
        return Err(SchemaError::Cycle(stuck.join(", ")));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::{
        partition, AttributeClass, AttributeRecord, ClassRecord, SchemaError, SchemaSnapshot,
        StorageKind,
    };
    use crate::handler::AttributeHandlerRegistry;
    use crate::model::flags::AttributeFlags;
    use crate::model::ids::{AttributeId, ClassId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn class(id: i64, name: &str, storage: StorageKind) -> ClassRecord {
        ClassRecord {
            id: ClassId(id),
            name: name.to_string(),
            table_name: Some(format!("rc_{name}")),
            storage,
            is_abstract: false,
        }
    }

    fn attr(id: i64, class_id: i64, name: &str, index: usize) -> AttributeRecord {
        AttributeRecord {
            id: AttributeId(id),
            class_id: ClassId(class_id),
            name: name.to_string(),
            type_name: "string".to_string(),
            index,
            flags: AttributeFlags::empty(),
            domain: None,
            column_name: None,
        }
    }

    fn types() -> BTreeMap<String, Arc<AttributeClass>> {
        let registry = AttributeHandlerRegistry::default();
        let mut types = BTreeMap::new();
        types.insert(
            "string".to_string(),
            Arc::new(AttributeClass::new("string", registry.instantiate("string").unwrap())),
        );
        types
    }

    #[test]
    fn diamond_closure_is_topological_and_deduplicated() {
        let snapshot = SchemaSnapshot::build(
            vec![
                class(1, "root", StorageKind::Builtin),
                class(2, "left", StorageKind::Table),
                class(3, "right", StorageKind::Dynamic),
                class(4, "leaf", StorageKind::Table),
            ],
            vec![
                (ClassId(2), ClassId(1)),
                (ClassId(3), ClassId(1)),
                (ClassId(4), ClassId(3)),
                (ClassId(4), ClassId(2)),
            ],
            vec![
                attr(1, 1, "name", 0),
                attr(2, 2, "l", 1),
                attr(3, 3, "r", 2),
                attr(4, 4, "x", 3),
            ],
            &types(),
        )
        .unwrap();

        let leaf = snapshot.class_by_name("leaf").unwrap();
        assert_eq!(
            leaf.lineage_ids(),
            vec![ClassId(1), ClassId(2), ClassId(3), ClassId(4)]
        );
        assert_eq!(leaf.attributes.len(), 4);
        assert_eq!(leaf.max_attribute_index, 3);
        assert_eq!(leaf.slot_count(), 4);
        assert!(leaf.is_a(ClassId(3)));

        let root = snapshot.class(ClassId(1)).unwrap();
        assert_eq!(root.descendants.len(), 3);

        let groups = partition(leaf);
        let storages: Vec<StorageKind> = groups.iter().map(|group| group.storage).collect();
        assert_eq!(
            storages,
            vec![StorageKind::Builtin, StorageKind::Table, StorageKind::Dynamic]
        );
        let table_classes: Vec<&str> = groups[1]
            .classes
            .iter()
            .map(|class| class.name.as_str())
            .collect();
        assert_eq!(table_classes, vec!["left", "leaf"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = SchemaSnapshot::build(
            vec![
                class(1, "a", StorageKind::Table),
                class(2, "b", StorageKind::Table),
            ],
            vec![(ClassId(1), ClassId(2)), (ClassId(2), ClassId(1))],
            Vec::new(),
            &types(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::Cycle(_)));
    }

    #[test]
    fn unknown_attribute_types_are_rejected() {
        let mut record = attr(1, 1, "x", 0);
        record.type_name = "blob".to_string();
        let err = SchemaSnapshot::build(
            vec![class(1, "a", StorageKind::Table)],
            Vec::new(),
            vec![record],
            &types(),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownAttributeType(_)));
    }

    #[test]
    fn empty_class_has_no_slots() {
        let snapshot = SchemaSnapshot::build(
            vec![class(1, "a", StorageKind::Table)],
            Vec::new(),
            Vec::new(),
            &types(),
        )
        .unwrap();
        let class = snapshot.class(ClassId(1)).unwrap();
        assert_eq!(class.max_attribute_index, -1);
        assert_eq!(class.slot_count(), 0);
        assert!(!class.has_concrete_attributes());
    }
}
